//! Liveness sweep.
//!
//! A session that has not been seen for `session.liveness_timeout_secs` is
//! assumed dead: an idle one is stopped, anything that was still spawning or
//! working is failed. Either way the normal terminal cascade runs. A session
//! whose termination was interrupted by a store failure is finished on the
//! next sweep, stale or not.

use std::time::Duration;

use chrono::{DateTime, Utc};
use conductor_traits::{EntityKind, Filter};
use conductor_types::{Session, SessionStatus};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{terminate_locked, SessionManager};
use crate::error::Result;

/// Terminal status given to a session that went quiet while in `status`.
pub fn stale_outcome(status: SessionStatus) -> SessionStatus {
    match status {
        SessionStatus::Idle => SessionStatus::Stopped,
        _ => SessionStatus::Failed,
    }
}

fn is_stale(session: &Session, now: DateTime<Utc>, timeout: Duration) -> bool {
    (now - session.last_seen())
        .to_std()
        .map(|quiet| quiet > timeout)
        .unwrap_or(false)
}

impl SessionManager {
    /// Terminate every live session not seen since `now - timeout`.
    /// Returns the sessions that were terminated.
    pub async fn sweep_stale(&self, now: DateTime<Utc>) -> Result<Vec<Session>> {
        let ctx = self.context();
        let timeout = ctx.config.session.liveness_timeout();
        let _gate = ctx.locks.cascade().await?;

        let live: Vec<Session> = ctx
            .list(
                EntityKind::Session,
                &Filter::all().one_of(
                    "authoritativeStatus",
                    [
                        SessionStatus::Spawning.as_str(),
                        SessionStatus::Idle.as_str(),
                        SessionStatus::Working.as_str(),
                    ],
                ),
            )
            .await?;

        let mut terminated = Vec::new();
        for session in live
            .into_iter()
            .filter(|s| s.is_terminating() || is_stale(s, now, timeout))
        {
            // 被中断的终止按原目标状态收尾
            let outcome = match &session.pending_termination {
                Some(pending) => pending.status,
                None => stale_outcome(session.authoritative_status),
            };
            warn!(
                session_id = %session.id,
                status = %session.authoritative_status,
                last_seen = %session.last_seen(),
                outcome = %outcome,
                "Session missed liveness deadline"
            );
            terminated.push(terminate_locked(ctx, session, outcome).await?);
        }
        Ok(terminated)
    }
}

/// Background sweep loop. Aborted on drop.
pub struct LivenessMonitor {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl LivenessMonitor {
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Ask the loop to exit and wait for it.
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for LivenessMonitor {
    fn drop(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Run [`SessionManager::sweep_stale`] every `interval` until `token` is
/// cancelled. Sweep errors are logged and the loop keeps going.
pub fn spawn_liveness_monitor(
    manager: SessionManager,
    interval: Duration,
    token: CancellationToken,
) -> LivenessMonitor {
    let loop_token = token.clone();
    let handle = tokio::spawn(async move {
        info!(interval_ms = interval.as_millis() as u64, "Liveness monitor started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = loop_token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let now = manager.context().now();
            match manager.sweep_stale(now).await {
                Ok(terminated) if !terminated.is_empty() => {
                    info!(count = terminated.len(), "Liveness sweep terminated sessions");
                }
                Ok(_) => debug!("Liveness sweep found nothing stale"),
                Err(e) => warn!(error = %e, "Liveness sweep failed"),
            }
        }

        info!("Liveness monitor stopped");
    });

    LivenessMonitor {
        token,
        handle: Some(handle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::context::KernelContext;
    use crate::event_bus::MemoryEventBus;
    use conductor_storage::MemoryStore;
    use conductor_types::{Actor, SessionRole, SpawnSessionInput};
    use std::sync::Arc;

    fn manager() -> SessionManager {
        SessionManager::new(KernelContext::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryEventBus::new()),
            KernelConfig::default(),
        ))
    }

    #[test]
    fn test_stale_outcome() {
        assert_eq!(stale_outcome(SessionStatus::Idle), SessionStatus::Stopped);
        assert_eq!(stale_outcome(SessionStatus::Working), SessionStatus::Failed);
        assert_eq!(stale_outcome(SessionStatus::Spawning), SessionStatus::Failed);
    }

    #[tokio::test]
    async fn test_sweep_terminates_only_stale_sessions() {
        let manager = manager();
        let op = Actor::operator();
        let idle = manager
            .spawn(SpawnSessionInput::new("p1", SessionRole::Worker), &op)
            .await
            .unwrap();
        manager.register_active(&idle.id, SessionStatus::Idle).await.unwrap();
        let working = manager
            .spawn(SpawnSessionInput::new("p1", SessionRole::Worker), &op)
            .await
            .unwrap();
        manager
            .register_active(&working.id, SessionStatus::Working)
            .await
            .unwrap();

        // 还未超时
        assert!(manager.sweep_stale(Utc::now()).await.unwrap().is_empty());

        let later = Utc::now() + chrono::Duration::seconds(600);
        let terminated = manager.sweep_stale(later).await.unwrap();
        assert_eq!(terminated.len(), 2);

        assert_eq!(
            manager.get(&idle.id).await.unwrap().authoritative_status,
            SessionStatus::Stopped
        );
        assert_eq!(
            manager.get(&working.id).await.unwrap().authoritative_status,
            SessionStatus::Failed
        );

        // 终止状态不会再次被处理
        assert!(manager.sweep_stale(later).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_monitor_stops_on_cancel() {
        let token = CancellationToken::new();
        let monitor = spawn_liveness_monitor(manager(), Duration::from_millis(10), token.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(monitor.is_running());

        token.cancel();
        monitor.stop().await;
    }
}
