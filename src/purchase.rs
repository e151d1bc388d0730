//! The buy flow: card activation through confirmation, with bounded waits
//! and a single go-back recovery.

use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::element::Element;
use chromiumoxide::page::Page;
use thiserror::Error;

use crate::session::{click_text_button, wait_text_button};

/// Buy/send control labels, lower-case.
const BUY_LABELS: [&str; 4] = ["купить", "buy", "отправить", "send"];
/// Confirmation control labels, lower-case.
const CONFIRM_LABELS: [&str; 2] = ["отправить подарок", "send gift"];

const BUY_TIMEOUT: Duration = Duration::from_secs(5);
const CONFIRM_TIMEOUT: Duration = Duration::from_secs(6);
const CONFIRM_CLICK_TIMEOUT: Duration = Duration::from_secs(2);

/// Why a purchase attempt did not complete. Attempts never abort the
/// sweep; the caller counts these and moves on.
#[derive(Debug, Error)]
pub enum PurchaseError {
    #[error("card did not open: {0}")]
    CardOpen(String),
    #[error("buy control did not appear within {0:?}")]
    BuyControl(Duration),
    #[error("confirm control did not appear within {0:?}")]
    ConfirmControl(Duration),
    #[error("confirm control vanished before the click")]
    ConfirmClick,
}

/// A completed purchase. The confirm control's label doubles as the
/// displayed price.
#[derive(Debug, Clone)]
pub struct PurchaseReceipt {
    pub price_text: String,
}

/// Seam over the UI buy flow so the sweep can be driven by fakes in tests.
#[async_trait]
pub trait PurchaseFlow {
    async fn attempt(&mut self, index: usize) -> Result<PurchaseReceipt, PurchaseError>;
}

/// Drives the real mini-app UI.
pub struct LivePurchaseFlow {
    page: Page,
    cards: Vec<Element>,
}

impl LivePurchaseFlow {
    pub fn new(page: Page, cards: Vec<Element>) -> Self {
        Self { page, cards }
    }

    async fn try_buy(&self, index: usize) -> Result<PurchaseReceipt, PurchaseError> {
        let card = self
            .cards
            .get(index)
            .ok_or_else(|| PurchaseError::CardOpen("card handle vanished".to_string()))?;

        card.click()
            .await
            .map_err(|e| PurchaseError::CardOpen(e.to_string()))?;

        if !click_text_button(&self.page, &BUY_LABELS, BUY_TIMEOUT).await {
            return Err(PurchaseError::BuyControl(BUY_TIMEOUT));
        }

        let price_text = wait_text_button(&self.page, &CONFIRM_LABELS, CONFIRM_TIMEOUT)
            .await
            .ok_or(PurchaseError::ConfirmControl(CONFIRM_TIMEOUT))?;

        if !click_text_button(&self.page, &CONFIRM_LABELS, CONFIRM_CLICK_TIMEOUT).await {
            return Err(PurchaseError::ConfirmClick);
        }

        Ok(PurchaseReceipt { price_text })
    }

    /// Best-effort return to the catalog after a failed attempt.
    async fn recover(&self) {
        if let Err(e) = self.page.evaluate("history.back()").await {
            tracing::debug!("history.back() after failed purchase also failed: {}", e);
        }
    }
}

#[async_trait]
impl PurchaseFlow for LivePurchaseFlow {
    async fn attempt(&mut self, index: usize) -> Result<PurchaseReceipt, PurchaseError> {
        let result = self.try_buy(index).await;
        if result.is_err() {
            self.recover().await;
        }
        result
    }
}
