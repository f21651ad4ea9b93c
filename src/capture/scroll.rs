//! Pagination helper
//!
//! Comment lists load more entries as the page scrolls. While scrolling is
//! enabled for the active tab, a ticker presses PageDown there so the page
//! keeps requesting the next batch.

use log::{debug, warn};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::registry::SessionRegistry;
use super::state::AttachmentState;
use super::types::TabId;
use crate::host::{DebuggerHost, HostResult, KeyEvent, KeyEventKind};

/// Hold time between key down and key up, before jitter
const KEY_HOLD_MS: u64 = 5;
const KEY_JITTER_MS: u64 = 10;

/// The tab to scroll right now, if any
pub fn scroll_target(registry: &SessionRegistry) -> Option<TabId> {
    let tab_id = registry.active_tab()?;
    if registry.attachment_state(tab_id) != AttachmentState::Attached {
        return None;
    }
    registry
        .scroll_state(tab_id)
        .filter(|scroll| scroll.enabled)
        .map(|_| tab_id)
}

/// Send one PageDown press to `tab_id`
pub async fn press_page_down(host: &dyn DebuggerHost, tab_id: TabId) -> HostResult<()> {
    host.dispatch_key(tab_id, KeyEvent::page_down(KeyEventKind::KeyDown))
        .await?;

    let jitter = rand::thread_rng().gen_range(0..KEY_JITTER_MS);
    tokio::time::sleep(Duration::from_millis(KEY_HOLD_MS + jitter)).await;

    host.dispatch_key(tab_id, KeyEvent::page_down(KeyEventKind::KeyUp))
        .await
}

/// Press PageDown on the scroll target every `period` until `running` turns false
pub fn spawn_scroll_ticker(
    host: Arc<dyn DebuggerHost>,
    registry: SessionRegistry,
    period: Duration,
    mut running: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = running.changed() => {
                    if changed.is_err() || !*running.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if let Some(tab_id) = scroll_target(&registry) {
                if let Err(e) = press_page_down(host.as_ref(), tab_id).await {
                    warn!("PageDown on tab {} failed: {}", tab_id, e);
                }
            }
        }
        debug!("Scroll ticker stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::state::{Generation, ScrollState};
    use crate::host::mock::{HostCall, MockHost};

    fn attached(registry: &SessionRegistry, tab: u64, scrolling: bool) {
        registry.begin_attach(TabId(tab), Generation(tab), "/v".into(), "u".into());
        registry.complete_attach(TabId(tab), Generation(tab), ScrollState { enabled: scrolling });
    }

    #[test]
    fn test_scroll_target_needs_active_enabled_tab() {
        let registry = SessionRegistry::new();
        attached(&registry, 1, true);
        attached(&registry, 2, false);
        assert_eq!(scroll_target(&registry), None);

        registry.set_active(Some(TabId(2)));
        assert_eq!(scroll_target(&registry), None);

        registry.set_active(Some(TabId(1)));
        assert_eq!(scroll_target(&registry), Some(TabId(1)));

        registry.set_scroll(TabId(1), false);
        assert_eq!(scroll_target(&registry), None);
    }

    #[test]
    fn test_attaching_tab_not_scrolled() {
        let registry = SessionRegistry::new();
        registry.begin_attach(TabId(1), Generation(1), "/v".into(), "u".into());
        registry.set_active(Some(TabId(1)));
        assert_eq!(scroll_target(&registry), None);
    }

    #[tokio::test]
    async fn test_press_sends_down_then_up() {
        let host = MockHost::new();
        press_page_down(host.as_ref(), TabId(3)).await.unwrap();

        assert_eq!(
            host.calls(),
            vec![
                HostCall::Key(TabId(3), KeyEvent::page_down(KeyEventKind::KeyDown)),
                HostCall::Key(TabId(3), KeyEvent::page_down(KeyEventKind::KeyUp)),
            ]
        );
    }

    #[tokio::test]
    async fn test_ticker_scrolls_until_stopped() {
        let host = MockHost::new();
        let registry = SessionRegistry::new();
        attached(&registry, 1, true);
        registry.set_active(Some(TabId(1)));
        let (running, stop) = watch::channel(true);

        let ticker = spawn_scroll_ticker(host.clone(), registry, Duration::from_millis(20), stop);

        let key_up = HostCall::Key(TabId(1), KeyEvent::page_down(KeyEventKind::KeyUp));
        for _ in 0..200 {
            if host.count(&key_up) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(host.count(&key_up) >= 2);

        running.send(false).unwrap();
        ticker.await.unwrap();
    }
}
