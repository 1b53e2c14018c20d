//! Running-pod listing and periodic pod disruption.
use std::{sync::Arc, time::Duration};

use fleet_core::{RunContext, StageError};
use fleet_model::NodeTarget;
use fleet_session::{Session, SessionError};
use rand::{SeedableRng, rngs::StdRng, seq::IndexedRandom};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::StageSettings;

/// Names of pods in phase `Running`, as listed by `kubectl get pod`.
///
/// Only rows whose STATUS column reads `Running` count; a terminal echo of
/// the command itself has no such column.
pub async fn running_pods(session: &mut Session, timeout: Duration) -> Result<Vec<String>, SessionError> {
    session.sync_barrier_within(timeout).await?;
    session
        .submit("kubectl get pod --field-selector=status.phase==Running")
        .await?;
    let lines = session.collect_to_barrier(timeout).await?;
    Ok(lines
        .iter()
        .filter_map(|l| {
            let mut cols = l.split_whitespace();
            let name = cols.next()?;
            (cols.nth(1) == Some("Running")).then(|| name.to_string())
        })
        .collect())
}

/// Service name of a generated pod name: segments carrying digits are dropped.
///
/// `pod/user-service-6d5f7c-x2k9q` becomes `user-service`.
pub fn service_name(pod: &str) -> String {
    let pod = pod.strip_prefix("pod/").unwrap_or(pod);
    let mut parts = pod.split('-');
    let mut out = parts.next().unwrap_or_default().to_string();
    for part in parts.filter(|p| !p.chars().any(|c| c.is_ascii_digit())) {
        out.push('-');
        out.push_str(part);
    }
    out
}

/// Deletes a few random benchmark pods every interval while load runs.
///
/// Victims are drawn from a seeded generator so that repeated runs disrupt
/// the same sequence of pods.
#[derive(Debug, Clone)]
pub struct Disruption {
    interval: Duration,
    kills: usize,
    seed: u64,
    allowed: Vec<String>,
}

impl Disruption {
    pub fn new(settings: &StageSettings) -> Self {
        Self {
            interval: settings.disruption_interval,
            kills: settings.disruption_kills,
            seed: settings.disruption_seed,
            allowed: settings.disruptable_pods.clone(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Up to `kills` distinct running pods that match an allowed service.
    pub fn pick(&self, rng: &mut StdRng, running: &[String]) -> Vec<String> {
        let mut candidates: Vec<&String> = running
            .iter()
            .filter(|pod| self.allowed.iter().any(|a| pod.contains(a.as_str())))
            .collect();
        candidates.sort();
        candidates
            .choose_multiple(rng, self.kills)
            .map(|p| (*p).clone())
            .collect()
    }

    /// Disrupt pods through `target` until `cancel` fires.
    ///
    /// Returns the number of deleted pods.
    pub async fn run(
        self,
        ctx: Arc<RunContext>,
        target: NodeTarget,
        cancel: CancellationToken,
    ) -> Result<u64, StageError> {
        let mut session = ctx.open(&target).await?;
        let res = self.disrupt(&mut session, &ctx, &cancel).await;
        if let Err(e) = session.terminate() {
            warn!(target: "fleet.stages.disruption", node = %target.id, error = %e, "session close failed");
        }
        res
    }

    async fn disrupt(
        &self,
        session: &mut Session,
        ctx: &RunContext,
        cancel: &CancellationToken,
    ) -> Result<u64, StageError> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut killed = 0u64;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            let running = match running_pods(session, ctx.timeouts().start).await {
                Ok(pods) => pods,
                Err(e) if e.is_timeout() => {
                    warn!(target: "fleet.stages.disruption", error = %e, "pod listing timed out");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let victims = self.pick(&mut rng, &running);
            debug!(target: "fleet.stages.disruption", running = running.len(), victims = victims.len(), "disruption round");
            for pod in victims {
                session.submit(&format!("kubectl delete pod {pod}")).await?;
                killed += 1;
                info!(target: "fleet.stages.disruption", %pod, service = %service_name(&pod), "pod deleted");
            }
        }
        info!(target: "fleet.stages.disruption", killed, "disruption stopped");
        Ok(killed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use fleet_model::NodeId;
    use fleet_session::testing::{ScriptHandle, ScriptedConnector, ScriptedTransport};

    const LISTING: [&str; 5] = [
        "NAME                                    READY   STATUS    RESTARTS   AGE",
        "jaeger-6c8d9f-abcde                     1/1     Running   0          5m",
        "media-frontend-7f9c5-zzzzz              1/1     Running   0          5m",
        "nginx-thrift-5b7d-qqqqq                 1/1     Running   0          5m",
        "user-service-6d5f7c-x2k9q               1/1     Running   1          5m",
    ];

    fn pods(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn listing_keeps_running_pod_names() {
        let t = ScriptedTransport::new().on("kubectl get pod", LISTING);
        let mut s = Session::new(NodeId::from("cloud0"), Box::new(t));

        let names = running_pods(&mut s, Duration::from_secs(5)).await.unwrap();
        assert_eq!(
            names,
            vec![
                "jaeger-6c8d9f-abcde",
                "media-frontend-7f9c5-zzzzz",
                "nginx-thrift-5b7d-qqqqq",
                "user-service-6d5f7c-x2k9q"
            ]
        );
    }

    #[tokio::test]
    async fn echoed_listing_command_is_not_a_pod() {
        let t = ScriptedTransport::new()
            .echo_input()
            .on("kubectl get pod", ["jaeger-6c8d9f-abcde 1/1 Running 0 5m"]);
        let mut s = Session::new(NodeId::from("cloud0"), Box::new(t));

        let names = running_pods(&mut s, Duration::from_secs(5)).await.unwrap();
        assert_eq!(names, vec!["jaeger-6c8d9f-abcde"]);
    }

    #[test]
    fn service_names_drop_generated_suffixes() {
        assert_eq!(service_name("pod/user-service-6d5f7c-x2k9q"), "user-service");
        assert_eq!(service_name("jaeger-6c8d9f-4bcde"), "jaeger");
    }

    #[test]
    fn picks_are_seeded_distinct_and_allowed() {
        let d = Disruption::new(&StageSettings::default());
        let running = pods(&[
            "jaeger-1",
            "media-frontend-2",
            "nginx-thrift-3",
            "user-service-4",
            "text-service-5",
            "user-memcached-6",
        ]);

        let a = d.pick(&mut StdRng::seed_from_u64(1), &running);
        let b = d.pick(&mut StdRng::seed_from_u64(1), &running);
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);
        assert!(a.iter().all(|p| !p.starts_with("media-frontend") && !p.starts_with("nginx-thrift")));
        let distinct: std::collections::HashSet<&String> = a.iter().collect();
        assert_eq!(distinct.len(), 3);
    }

    #[test]
    fn nothing_to_pick_from_protected_pods_only() {
        let d = Disruption::new(&StageSettings::default());
        let running = pods(&["media-frontend-2", "nginx-thrift-3"]);
        assert!(d.pick(&mut StdRng::seed_from_u64(1), &running).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn deletes_pods_each_interval_until_cancelled() {
        let handles: Arc<Mutex<Vec<ScriptHandle>>> = Arc::default();
        let sink = Arc::clone(&handles);
        let connector = ScriptedConnector::new(move |_| {
            let t = ScriptedTransport::new().on("kubectl get pod", LISTING);
            sink.lock().unwrap().push(t.handle());
            Ok(t)
        });
        let ctx = Arc::new(RunContext::new(Arc::new(connector)));
        let cancel = CancellationToken::new();
        let disruption = Disruption::new(&StageSettings::default()).with_interval(Duration::from_secs(60));

        let task = tokio::spawn(disruption.run(
            Arc::clone(&ctx),
            NodeTarget::new(0, "cloud_controller", "192.168.221.2"),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_secs(150)).await;
        cancel.cancel();

        // Two rounds, each deleting both allowed pods of the listing.
        assert_eq!(task.await.unwrap().unwrap(), 4);
        let script = &handles.lock().unwrap()[0];
        let deletes = script.sent().iter().filter(|l| l.starts_with("kubectl delete pod")).count();
        assert_eq!(deletes, 4);
        assert_eq!(script.terminations(), 1);
    }
}
