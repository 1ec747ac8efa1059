//! Frame loop: run each zone's pattern at the configured rate and publish
//! the result as `entities` frames.

use std::sync::Arc;
use std::time::{Duration, Instant};

use glowproto::Message;
use patternette::PatternHost;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::server::Ingress;
use crate::stage::{FramePlan, FrameSource, Stage};

/// Turn one plan into its `entities` frame. Runs pattern code, so call it
/// off the async workers.
pub fn render(plan: FramePlan, host: &PatternHost, dt: f64) -> Message {
    let entities = match plan.source {
        FrameSource::External(entities) => entities,
        FrameSource::Pattern => host.calculate(&plan.zone, &plan.audio, &plan.config, dt),
    };
    Message::Entities {
        zone: plan.zone,
        frame: plan.frame,
        entities,
    }
}

/// Render every zone once and broadcast the frames. Returns how many frames
/// were published.
pub async fn tick(stage: &Arc<Stage>, ingress: &Ingress, dt: f64) -> usize {
    let plans = stage.plan_frames();
    if plans.is_empty() {
        return 0;
    }

    let host = stage.host().clone();
    let rendered = tokio::task::spawn_blocking(move || {
        plans
            .into_iter()
            .map(|plan| render(plan, &host, dt))
            .collect::<Vec<_>>()
    })
    .await;

    let frames = match rendered {
        Ok(frames) => frames,
        Err(e) => {
            warn!(error = %e, "Frame render task failed");
            return 0;
        }
    };

    let published = frames.len();
    for frame in &frames {
        ingress.broadcast(frame);
    }
    published
}

pub fn spawn_frame_loop(
    stage: Arc<Stage>,
    ingress: Arc<Ingress>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last = Instant::now();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let dt = now.duration_since(last).as_secs_f64();
                    last = now;

                    // nobody is listening; keep patterns paused
                    if ingress.registry().is_empty() {
                        continue;
                    }
                    tick(&stage, &ingress, dt).await;
                }
                _ = cancel.cancelled() => {
                    debug!("frame loop shutting down");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Connection, Outbound};
    use glowconf::InfraConfig;
    use patternette::{PatternCatalog, SandboxConfig};

    fn setup() -> (Arc<Stage>, Arc<Ingress>) {
        let host = PatternHost::new(Arc::new(PatternCatalog::builtin()), SandboxConfig::default());
        let stage = Arc::new(Stage::new(Arc::new(host)));
        let ingress = Ingress::new(&InfraConfig::default(), stage.clone()).unwrap();
        (stage, ingress)
    }

    #[tokio::test]
    async fn tick_publishes_one_frame_per_active_zone() {
        let (stage, ingress) = setup();
        stage.set_pattern("main", "spectrum_bars").unwrap();
        stage.host().get("main").unwrap().settled().await;

        let (conn, mut rx) = Connection::new("127.0.0.1:7000".parse().unwrap(), 8);
        ingress.registry().insert(conn);

        assert_eq!(tick(&stage, &ingress, 1.0 / 30.0).await, 1);
        match rx.try_recv().unwrap() {
            Outbound::Text(text) => match Message::parse(&text, usize::MAX).unwrap() {
                Message::Entities {
                    zone,
                    frame,
                    entities,
                } => {
                    assert_eq!(zone, "main");
                    assert_eq!(frame, 1);
                    assert_eq!(entities.len(), 64);
                }
                other => panic!("Expected entities, got {:?}", other),
            },
            other => panic!("Expected text, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn zones_without_pattern_or_batch_are_skipped() {
        let (stage, ingress) = setup();
        assert_eq!(tick(&stage, &ingress, 0.033).await, 0);
    }
}
