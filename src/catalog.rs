//! Catalog scanning: card enumeration, field extraction and identity keys.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chromiumoxide::element::Element;
use chromiumoxide::page::Page;
use serde::Deserialize;

use crate::session::{click_text_button, dump_debug_artifacts};

/// Card selector union covering the test-id, class and camelCase variants
/// the mini-app has shipped.
const CARD_ITEM: &str =
    "[data-test-id='gift-card'], .gift-card, [class*='giftCard'], [class*='GiftCard']";
const CARD_TITLE: &str = ".title, [data-test-id='gift-title'], [class*='Title']";
const CARD_BADGE: &str = ".badge, .label, [data-test-id='gift-badge'], [class*='Badge']";
const CARD_FRAME: &str = ".card, .frame, .container, [class*='card']";

/// Identity-key fallback keeps this many characters of markup.
const KEY_SNIPPET_CHARS: usize = 96;

const RESCAN_DELAY: Duration = Duration::from_secs(3);

/// Per-card fields pulled out of the live DOM. Extraction is best effort;
/// failures leave fields empty rather than dropping the card.
#[derive(Debug, Clone)]
pub struct CardSnapshot {
    pub index: usize,
    pub title: String,
    pub badge: String,
    pub key: String,
}

#[derive(Debug, Deserialize)]
struct RawCard {
    #[serde(default)]
    title: String,
    #[serde(default)]
    badge: String,
    #[serde(default)]
    html: String,
}

/// The catalog surface of the mini-app page.
pub struct CatalogView {
    page: Page,
    debug_dir: PathBuf,
}

impl CatalogView {
    pub fn new(page: Page, debug_dir: PathBuf) -> Self {
        Self { page, debug_dir }
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    /// Step from the gifts landing screen into the catalog. Every click is
    /// best effort; the screen may already be where we want it.
    pub async fn enter_catalog(&self) {
        if click_text_button(
            &self.page,
            &["отправить подарок", "send a gift"],
            Duration::ZERO,
        )
        .await
        {
            tokio::time::sleep(Duration::from_millis(350)).await;
        }
        if click_text_button(
            &self.page,
            &["отправить себе", "send to myself"],
            Duration::ZERO,
        )
        .await
        {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// Re-select the "all gifts" tab so new drops are visible.
    pub async fn refresh(&self) {
        if click_text_button(&self.page, &["все подарки", "all gifts"], Duration::ZERO).await {
            tokio::time::sleep(Duration::from_millis(350)).await;
        }
    }

    /// Enumerate card elements. Zero cards is tolerated: dump debug
    /// artifacts, wait briefly, rescan once and proceed with whatever the
    /// second pass finds.
    pub async fn scan(&self) -> Vec<Element> {
        let mut cards = self.find_cards().await;

        if cards.is_empty() {
            tracing::warn!("No cards on screen, saving debug artifacts and rescanning");
            if let Err(e) = dump_debug_artifacts(&self.page, &self.debug_dir).await {
                tracing::warn!("Failed to write debug artifacts: {}", e);
            }
            tokio::time::sleep(RESCAN_DELAY).await;
            cards = self.find_cards().await;
        }

        tracing::info!("Cards on screen: {}", cards.len());
        cards
    }

    async fn find_cards(&self) -> Vec<Element> {
        self.page.find_elements(CARD_ITEM).await.unwrap_or_default()
    }

    /// Extract title, badge and markup for every card in one pass and
    /// derive the identity keys. Indexes line up with `scan`'s elements.
    pub async fn snapshots(&self) -> Result<Vec<CardSnapshot>> {
        let card_sel = serde_json::to_string(CARD_ITEM)?;
        let title_sel = serde_json::to_string(CARD_TITLE)?;
        let badge_sel = serde_json::to_string(CARD_BADGE)?;
        let script = format!(
            r#"(() => {{
                const cards = Array.from(document.querySelectorAll({card_sel}));
                return cards.map(card => {{
                    let title = '';
                    let badge = '';
                    let html = '';
                    try {{
                        const el = card.querySelector({title_sel});
                        title = el ? (el.innerText || '').trim() : '';
                    }} catch (_) {{}}
                    try {{
                        const el = card.querySelector({badge_sel});
                        badge = el ? (el.innerText || '').trim() : '';
                    }} catch (_) {{}}
                    try {{ html = card.outerHTML || ''; }} catch (_) {{}}
                    return {{ title: title, badge: badge, html: html }};
                }});
            }})()"#
        );

        let raw: Vec<RawCard> = self
            .page
            .evaluate(script)
            .await
            .context("Card extraction script failed")?
            .into_value()
            .context("Card extraction returned an unexpected shape")?;

        Ok(raw
            .into_iter()
            .enumerate()
            .map(|(index, card)| {
                let key = identity_key(&card.title, &card.html);
                CardSnapshot {
                    index,
                    title: card.title,
                    badge: card.badge,
                    key,
                }
            })
            .collect())
    }

    /// Probe the computed frame color of one card. `None` when the card is
    /// gone or the probe fails; the classifier fails open on that.
    pub async fn probe_frame_color(&self, index: usize) -> Option<String> {
        let card_sel = serde_json::to_string(CARD_ITEM).ok()?;
        let frame_sel = serde_json::to_string(CARD_FRAME).ok()?;
        let script = format!(
            r#"(() => {{
                const cards = document.querySelectorAll({card_sel});
                const card = cards[{index}];
                if (!card) return null;
                const frame = card.querySelector({frame_sel}) || card;
                const s = getComputedStyle(frame);
                return (s.borderColor || s.outlineColor || s.boxShadow || '').toString();
            }})()"#
        );

        match self.page.evaluate(script).await {
            Ok(eval) => eval.into_value::<Option<String>>().ok().flatten(),
            Err(e) => {
                tracing::debug!("Frame color probe failed for card {}: {}", index, e);
                None
            }
        }
    }
}

/// Identity key for dedup across scans: the title when present, else a
/// truncated snippet of the card's markup. Markup-derived keys can change
/// when the surface re-renders an unchanged item; no stable upstream id
/// exists, so that wobble is accepted.
pub fn identity_key(title: &str, markup: &str) -> String {
    if !title.is_empty() {
        return title.to_string();
    }
    let snippet: String = markup.trim().chars().take(KEY_SNIPPET_CHARS).collect();
    format!("html:{}", snippet)
}
