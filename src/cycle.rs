//! The poll loop: per-cycle browser lifecycle, catalog sweep and the
//! counters that make every skip and failure visible.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use rand::Rng;

use crate::catalog::{CardSnapshot, CatalogView};
use crate::classify::Classifier;
use crate::config::Config;
use crate::notify::{bought_message, build_notifier, new_gift_message, Notifier};
use crate::purchase::{LivePurchaseFlow, PurchaseFlow};
use crate::session::{NavTimeout, SessionDriver};
use crate::store::SetFile;

/// Cooperative stop flag. Checked between cycles and between purchase
/// attempts; an in-flight UI step is never interrupted.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What one cycle did, skip reasons included.
#[derive(Debug, Default, Clone)]
pub struct CycleStats {
    pub cards: usize,
    pub new_notified: u32,
    pub premium: u32,
    pub skipped_not_premium: u32,
    pub skipped_bought: u32,
    pub attempted: u32,
    pub bought: u32,
    pub failed: u32,
    pub cap_reached: bool,
    pub cancelled: bool,
}

impl fmt::Display for CycleStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cards={} new={} premium={} attempted={} bought={} failed={} \
             skipped_bought={} skipped_not_premium={}",
            self.cards,
            self.new_notified,
            self.premium,
            self.attempted,
            self.bought,
            self.failed,
            self.skipped_bought,
            self.skipped_not_premium
        )?;
        if self.cap_reached {
            write!(f, " cap_reached")?;
        }
        if self.cancelled {
            write!(f, " cancelled")?;
        }
        Ok(())
    }
}

/// Poll until cancelled. A failed cycle is logged and retried after the
/// configured interval; nothing short of a signal stops the process.
pub async fn run_forever(cfg: &Config, cancel: &CancelFlag) -> Result<()> {
    let classifier = Classifier::new(&cfg.premium_words)?;
    let notifier = build_notifier(cfg);
    let mut seen = SetFile::load(&cfg.seen_file);
    let mut bought = SetFile::load(&cfg.bought_file);

    tracing::info!(
        "Hunting premium gifts: {} seen, {} bought, checking every {:?}",
        seen.len(),
        bought.len(),
        cfg.check_interval
    );

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match run_cycle(cfg, &classifier, notifier.as_ref(), &mut seen, &mut bought, cancel).await
        {
            Ok(stats) => tracing::info!("Cycle complete: {}", stats),
            Err(e) if e.downcast_ref::<NavTimeout>().is_some() => {
                tracing::warn!("{}; retrying next cycle", e)
            }
            Err(e) => tracing::error!("Cycle failed: {:#}", e),
        }

        if cancel.is_cancelled() {
            break;
        }
        tokio::time::sleep(cfg.check_interval).await;
    }

    tracing::info!("Hunter stopped");
    Ok(())
}

/// Run exactly one cycle and return its outcome.
pub async fn run_once(cfg: &Config) -> Result<()> {
    let classifier = Classifier::new(&cfg.premium_words)?;
    let notifier = build_notifier(cfg);
    let mut seen = SetFile::load(&cfg.seen_file);
    let mut bought = SetFile::load(&cfg.bought_file);

    let cancel = CancelFlag::new();
    let stats = run_cycle(cfg, &classifier, notifier.as_ref(), &mut seen, &mut bought, &cancel)
        .await?;
    tracing::info!("Cycle complete: {}", stats);
    Ok(())
}

/// One cycle: fresh browser in, browser down on the way out regardless of
/// how the body ended.
async fn run_cycle(
    cfg: &Config,
    classifier: &Classifier,
    notifier: &dyn Notifier,
    seen: &mut SetFile,
    bought: &mut SetFile,
    cancel: &CancelFlag,
) -> Result<CycleStats> {
    let mut driver = SessionDriver::launch(cfg).await?;
    let result = cycle_body(cfg, &mut driver, classifier, notifier, seen, bought, cancel).await;
    if let Err(e) = driver.close().await {
        tracing::debug!("Browser close failed: {}", e);
    }
    result
}

async fn cycle_body(
    cfg: &Config,
    driver: &mut SessionDriver,
    classifier: &Classifier,
    notifier: &dyn Notifier,
    seen: &mut SetFile,
    bought: &mut SetFile,
    cancel: &CancelFlag,
) -> Result<CycleStats> {
    if !driver.restore_state(cfg).await? {
        tracing::debug!("No saved session state, starting fresh");
    }
    driver.ensure_login(cfg).await?;

    let webview = driver.open_gifts_webapp().await?;
    let catalog = CatalogView::new(webview, cfg.data_dir.clone());
    catalog.enter_catalog().await;
    catalog.refresh().await;

    let cards = catalog.scan().await;
    let snapshots = catalog.snapshots().await?;

    // Keyword hits skip the style probe; only inconclusive cards pay for a
    // computed-style round trip.
    let mut classified = Vec::with_capacity(snapshots.len());
    for snap in snapshots {
        let premium = classifier.keyword_premium(&snap.title, &snap.badge) || {
            let color = catalog.probe_frame_color(snap.index).await;
            classifier.border_premium(color.as_deref())
        };
        classified.push((snap, premium));
    }

    let mut flow = LivePurchaseFlow::new(catalog.page().clone(), cards);
    run_sweep(cfg, &classified, &mut flow, notifier, seen, bought, cancel).await
}

/// Walk the classified cards in scan order: notify about new ones, buy the
/// premium ones not yet owned, stop at the per-cycle cap.
///
/// New-item notifications precede the premium check so the operator hears
/// about every drop. The seen-set insert sits inside the notify gate; items
/// past the per-cycle notify limit stay unseen and get announced on a later
/// cycle.
pub async fn run_sweep(
    cfg: &Config,
    items: &[(CardSnapshot, bool)],
    flow: &mut dyn PurchaseFlow,
    notifier: &dyn Notifier,
    seen: &mut SetFile,
    bought: &mut SetFile,
    cancel: &CancelFlag,
) -> Result<CycleStats> {
    let mut stats = CycleStats {
        cards: items.len(),
        ..CycleStats::default()
    };

    for (snap, premium) in items {
        if cancel.is_cancelled() {
            stats.cancelled = true;
            break;
        }

        if !seen.contains(&snap.key) && stats.new_notified < cfg.new_notify_limit {
            if !cfg.dry_run {
                if let Err(e) = notifier.send(&new_gift_message(&snap.title)).await {
                    tracing::warn!("New-gift notification failed: {}", e);
                }
                seen.insert(&snap.key);
                seen.save()?;
            }
            stats.new_notified += 1;
        }

        if !premium {
            stats.skipped_not_premium += 1;
            continue;
        }
        stats.premium += 1;

        if bought.contains(&snap.key) {
            stats.skipped_bought += 1;
            continue;
        }

        let label = if snap.title.is_empty() {
            snap.key.as_str()
        } else {
            snap.title.as_str()
        };
        tracing::info!("Premium candidate: {}", label);

        if cfg.dry_run {
            tracing::info!("Dry run: not buying {}", label);
            continue;
        }

        stats.attempted += 1;
        match flow.attempt(snap.index).await {
            Ok(receipt) => {
                bought.insert(&snap.key);
                bought.save()?;
                if let Err(e) = notifier.send(&bought_message(label, &receipt.price_text)).await {
                    tracing::warn!("Purchase notification failed: {}", e);
                }
                tracing::info!("Bought {} ({})", label, receipt.price_text);
                stats.bought += 1;
                if stats.bought >= cfg.max_buys_per_cycle {
                    stats.cap_reached = true;
                    tracing::info!("Purchase cap reached for this cycle");
                    break;
                }
                pause_between_buys(cfg).await;
            }
            Err(e) => {
                tracing::warn!("Purchase attempt failed for {}: {}", label, e);
                stats.failed += 1;
            }
        }
    }

    Ok(stats)
}

/// Fixed pause plus uniform jitter after each successful purchase.
async fn pause_between_buys(cfg: &Config) {
    let jitter_ms = cfg.purchase_jitter.as_millis() as u64;
    let jitter = if jitter_ms == 0 {
        std::time::Duration::ZERO
    } else {
        std::time::Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
    };
    let pause = cfg.purchase_pause + jitter;
    if !pause.is_zero() {
        tokio::time::sleep(pause).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::catalog::identity_key;
    use crate::classify::parse_keywords;
    use crate::notify::NotifyError;
    use crate::purchase::{PurchaseError, PurchaseReceipt};

    struct FakeFlow {
        results: VecDeque<Result<PurchaseReceipt, PurchaseError>>,
        calls: Vec<usize>,
        cancel_on_call: Option<CancelFlag>,
    }

    impl FakeFlow {
        fn ok() -> Self {
            Self {
                results: VecDeque::new(),
                calls: Vec::new(),
                cancel_on_call: None,
            }
        }

        fn scripted(results: Vec<Result<PurchaseReceipt, PurchaseError>>) -> Self {
            Self {
                results: results.into(),
                calls: Vec::new(),
                cancel_on_call: None,
            }
        }

        fn cancelling(flag: CancelFlag) -> Self {
            Self {
                results: VecDeque::new(),
                calls: Vec::new(),
                cancel_on_call: Some(flag),
            }
        }
    }

    #[async_trait]
    impl PurchaseFlow for FakeFlow {
        async fn attempt(&mut self, index: usize) -> Result<PurchaseReceipt, PurchaseError> {
            self.calls.push(index);
            if let Some(flag) = &self.cancel_on_call {
                flag.cancel();
            }
            self.results.pop_front().unwrap_or_else(|| {
                Ok(PurchaseReceipt {
                    price_text: "25 ⭐".to_string(),
                })
            })
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<String>>,
    }

    impl RecordingNotifier {
        fn messages(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, text: &str) -> Result<(), NotifyError> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn send(&self, _text: &str) -> Result<(), NotifyError> {
            Err(NotifyError::Api {
                status: 500,
                body: "boom".to_string(),
            })
        }
    }

    fn snap(index: usize, title: &str, badge: &str) -> CardSnapshot {
        let markup = format!("<div data-card=\"{}\"></div>", index);
        CardSnapshot {
            index,
            title: title.to_string(),
            badge: badge.to_string(),
            key: identity_key(title, &markup),
        }
    }

    fn premium_items(count: usize) -> Vec<(CardSnapshot, bool)> {
        (0..count)
            .map(|i| (snap(i, &format!("Premium {}", i), ""), true))
            .collect()
    }

    fn plain_items(count: usize) -> Vec<(CardSnapshot, bool)> {
        (0..count)
            .map(|i| (snap(i, &format!("Gift {}", i), ""), false))
            .collect()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        cfg: Config,
        seen: SetFile,
        bought: SetFile,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::for_tests(dir.path());
        let seen = SetFile::load(&cfg.seen_file);
        let bought = SetFile::load(&cfg.bought_file);
        Fixture {
            _dir: dir,
            cfg,
            seen,
            bought,
        }
    }

    #[tokio::test]
    async fn sweep_respects_purchase_cap_in_scan_order() {
        let mut fx = fixture();
        let items = premium_items(7);
        let mut flow = FakeFlow::ok();
        let notifier = RecordingNotifier::default();
        let cancel = CancelFlag::new();

        let stats = run_sweep(
            &fx.cfg, &items, &mut flow, &notifier, &mut fx.seen, &mut fx.bought, &cancel,
        )
        .await
        .unwrap();

        assert_eq!(stats.cards, 7);
        assert_eq!(stats.attempted, 5);
        assert_eq!(stats.bought, 5);
        assert!(stats.cap_reached);
        assert_eq!(flow.calls, vec![0, 1, 2, 3, 4]);
        assert_eq!(fx.bought.len(), 5);
    }

    #[tokio::test]
    async fn sweep_buys_everything_when_under_cap() {
        let mut fx = fixture();
        let items = premium_items(2);
        let mut flow = FakeFlow::ok();
        let notifier = RecordingNotifier::default();
        let cancel = CancelFlag::new();

        let stats = run_sweep(
            &fx.cfg, &items, &mut flow, &notifier, &mut fx.seen, &mut fx.bought, &cancel,
        )
        .await
        .unwrap();

        assert_eq!(stats.bought, 2);
        assert!(!stats.cap_reached);
    }

    #[tokio::test]
    async fn sweep_never_rebuys_recorded_items() {
        let mut fx = fixture();
        let items = premium_items(2);
        fx.bought.insert(&items[0].0.key);
        let mut flow = FakeFlow::ok();
        let notifier = RecordingNotifier::default();
        let cancel = CancelFlag::new();

        let stats = run_sweep(
            &fx.cfg, &items, &mut flow, &notifier, &mut fx.seen, &mut fx.bought, &cancel,
        )
        .await
        .unwrap();

        assert_eq!(stats.skipped_bought, 1);
        assert_eq!(stats.attempted, 1);
        assert_eq!(flow.calls, vec![1]);
    }

    #[tokio::test]
    async fn sweep_notifies_each_new_item_once() {
        let mut fx = fixture();
        let items = plain_items(3);
        let notifier = RecordingNotifier::default();
        let cancel = CancelFlag::new();

        let mut flow = FakeFlow::ok();
        let first = run_sweep(
            &fx.cfg, &items, &mut flow, &notifier, &mut fx.seen, &mut fx.bought, &cancel,
        )
        .await
        .unwrap();
        assert_eq!(first.new_notified, 3);
        assert_eq!(notifier.messages().len(), 3);

        // Same keys come back classified premium this time; they get bought
        // but never re-announced as new.
        let reclassified: Vec<(CardSnapshot, bool)> =
            items.iter().map(|(s, _)| (s.clone(), true)).collect();
        let mut flow = FakeFlow::ok();
        let second = run_sweep(
            &fx.cfg, &reclassified, &mut flow, &notifier, &mut fx.seen, &mut fx.bought, &cancel,
        )
        .await
        .unwrap();
        assert_eq!(second.new_notified, 0);
        assert_eq!(second.bought, 3);
        let new_messages = notifier
            .messages()
            .iter()
            .filter(|m| m.starts_with("🆕"))
            .count();
        assert_eq!(new_messages, 3);
    }

    #[tokio::test]
    async fn notify_limit_defers_overflow_to_a_later_cycle() {
        let mut fx = fixture();
        fx.cfg.new_notify_limit = 2;
        let items = plain_items(4);
        let notifier = RecordingNotifier::default();
        let cancel = CancelFlag::new();

        let mut flow = FakeFlow::ok();
        let first = run_sweep(
            &fx.cfg, &items, &mut flow, &notifier, &mut fx.seen, &mut fx.bought, &cancel,
        )
        .await
        .unwrap();
        assert_eq!(first.new_notified, 2);
        assert_eq!(fx.seen.len(), 2);

        // The two items past the limit were left unseen and surface now.
        let mut flow = FakeFlow::ok();
        let second = run_sweep(
            &fx.cfg, &items, &mut flow, &notifier, &mut fx.seen, &mut fx.bought, &cancel,
        )
        .await
        .unwrap();
        assert_eq!(second.new_notified, 2);
        assert_eq!(fx.seen.len(), 4);
        assert_eq!(notifier.messages().len(), 4);
    }

    #[tokio::test]
    async fn sweep_buys_premium_and_skips_the_rest() {
        let mut fx = fixture();
        let classifier = Classifier::new(&parse_keywords("premium,премиум")).unwrap();

        let snaps = vec![snap(0, "Cool Gift", ""), snap(1, "Premium Star", ""), snap(2, "", "премиум")];
        let items: Vec<(CardSnapshot, bool)> = snaps
            .into_iter()
            .map(|s| {
                let premium = classifier.keyword_premium(&s.title, &s.badge);
                (s, premium)
            })
            .collect();

        let mut flow = FakeFlow::scripted(vec![
            Ok(PurchaseReceipt {
                price_text: "500 ⭐".to_string(),
            }),
            Ok(PurchaseReceipt {
                price_text: "120 ⭐".to_string(),
            }),
        ]);
        let notifier = RecordingNotifier::default();
        let cancel = CancelFlag::new();

        let stats = run_sweep(
            &fx.cfg, &items, &mut flow, &notifier, &mut fx.seen, &mut fx.bought, &cancel,
        )
        .await
        .unwrap();

        assert_eq!(stats.cards, 3);
        assert_eq!(stats.new_notified, 3);
        assert_eq!(stats.premium, 2);
        assert_eq!(stats.skipped_not_premium, 1);
        assert_eq!(stats.bought, 2);
        assert_eq!(flow.calls, vec![1, 2]);

        assert_eq!(fx.bought.len(), 2);
        assert!(fx.bought.contains("Premium Star"));
        assert!(fx.bought.contains(&identity_key("", "<div data-card=\"2\"></div>")));
        assert!(!fx.bought.contains("Cool Gift"));

        let messages = notifier.messages();
        assert_eq!(messages[0], "🆕 New gift: Cool Gift");
        assert_eq!(messages[1], "🆕 New gift: Premium Star");
        assert_eq!(messages[2], "✅ Bought gift: Premium Star (500 ⭐)");
        assert_eq!(messages[3], "🆕 New gift: (untitled)");
        assert!(messages[4].starts_with("✅ Bought gift: html:"));
        assert!(messages[4].ends_with("(120 ⭐)"));
    }

    #[tokio::test]
    async fn sweep_continues_after_a_failed_attempt() {
        let mut fx = fixture();
        let items = premium_items(2);
        let mut flow = FakeFlow::scripted(vec![
            Err(PurchaseError::BuyControl(Duration::from_secs(5))),
            Ok(PurchaseReceipt {
                price_text: "40 ⭐".to_string(),
            }),
        ]);
        let notifier = RecordingNotifier::default();
        let cancel = CancelFlag::new();

        let stats = run_sweep(
            &fx.cfg, &items, &mut flow, &notifier, &mut fx.seen, &mut fx.bought, &cancel,
        )
        .await
        .unwrap();

        assert_eq!(stats.attempted, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.bought, 1);
        assert!(!fx.bought.contains(&items[0].0.key));
        assert!(fx.bought.contains(&items[1].0.key));
    }

    #[tokio::test]
    async fn sweep_stops_at_the_cancel_checkpoint() {
        let mut fx = fixture();
        let items = premium_items(3);
        let cancel = CancelFlag::new();
        let mut flow = FakeFlow::cancelling(cancel.clone());
        let notifier = RecordingNotifier::default();

        let stats = run_sweep(
            &fx.cfg, &items, &mut flow, &notifier, &mut fx.seen, &mut fx.bought, &cancel,
        )
        .await
        .unwrap();

        assert_eq!(stats.attempted, 1);
        assert_eq!(stats.bought, 1);
        assert!(stats.cancelled);
        assert_eq!(flow.calls, vec![0]);
    }

    #[tokio::test]
    async fn dry_run_touches_nothing() {
        let mut fx = fixture();
        fx.cfg.dry_run = true;
        let items = premium_items(2);
        let mut flow = FakeFlow::ok();
        let notifier = RecordingNotifier::default();
        let cancel = CancelFlag::new();

        let stats = run_sweep(
            &fx.cfg, &items, &mut flow, &notifier, &mut fx.seen, &mut fx.bought, &cancel,
        )
        .await
        .unwrap();

        assert_eq!(stats.new_notified, 2);
        assert_eq!(stats.premium, 2);
        assert_eq!(stats.attempted, 0);
        assert_eq!(stats.bought, 0);
        assert!(flow.calls.is_empty());
        assert!(notifier.messages().is_empty());
        assert!(fx.seen.is_empty());
        assert!(fx.bought.is_empty());
        assert!(!fx.cfg.seen_file.exists());
        assert!(!fx.cfg.bought_file.exists());
    }

    #[tokio::test]
    async fn failed_notification_still_marks_the_item_seen() {
        let mut fx = fixture();
        let items = plain_items(1);
        let mut flow = FakeFlow::ok();
        let cancel = CancelFlag::new();

        let stats = run_sweep(
            &fx.cfg, &items, &mut flow, &FailingNotifier, &mut fx.seen, &mut fx.bought, &cancel,
        )
        .await
        .unwrap();

        assert_eq!(stats.new_notified, 1);
        assert!(fx.seen.contains(&items[0].0.key));
        assert!(fx.cfg.seen_file.exists());
    }

    #[test]
    fn stats_display_appends_flags_only_when_set() {
        let mut stats = CycleStats {
            cards: 3,
            bought: 1,
            ..CycleStats::default()
        };
        let plain = stats.to_string();
        assert!(plain.starts_with("cards=3"));
        assert!(!plain.contains("cap_reached"));

        stats.cap_reached = true;
        stats.cancelled = true;
        let flagged = stats.to_string();
        assert!(flagged.ends_with("cap_reached cancelled"));
    }
}
