//! Synthetic build driven through the operation tracker

use crate::error::CliError;
use crate::events::EventPrinter;
use buildops_config::Config;
use buildops_errors::{BuildError, Error};
use buildops_events::{channel, EventReceiver, Interest, TracingListener};
use buildops_operations::{BuildOperations, BuildSummary, OperationContext, QueueReport};
use buildops_types::{OperationDescriptor, OperationKind, OperationStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tracing::{info, warn};

/// Parameters of one simulated build
#[derive(Debug, Clone, Copy)]
pub struct Simulation {
    pub tasks: usize,
    pub fail_every: Option<usize>,
    pub trace_events: bool,
}

impl Simulation {
    /// Failure injected into task `index`, if any
    fn failure_for(&self, index: usize) -> Option<BuildError> {
        let every = self.fail_every?;
        if (index + 1) % every != 0 {
            return None;
        }
        // alternate between user-facing and internal failures
        Some(if ((index + 1) / every) % 2 == 1 {
            BuildError::ValidationFailed {
                message: format!("task-{index} has an invalid input"),
            }
        } else {
            BuildError::Internal {
                message: format!("task-{index} crashed"),
            }
        })
    }
}

/// Outcome of a simulated build
#[derive(Debug)]
pub struct SimulationReport {
    pub queue: QueueReport,
    pub session: BuildSummary,
    pub events: usize,
    pub finished: Vec<(OperationStatus, usize)>,
}

impl SimulationReport {
    pub fn to_json(&self) -> serde_json::Value {
        let finished: serde_json::Map<String, serde_json::Value> = self
            .finished
            .iter()
            .map(|(status, count)| (status.to_string(), (*count).into()))
            .collect();
        serde_json::json!({
            "status": self.queue.status,
            "tasks": self.queue.total(),
            "events": self.events,
            "finished": finished,
            "still_running": self.session.still_running,
        })
    }
}

/// Run the simulation, printing events while the build progresses
pub async fn run(
    config: &Config,
    simulation: Simulation,
    json: bool,
) -> Result<SimulationReport, CliError> {
    let operations = Arc::new(BuildOperations::with_config(config));
    let (listener, receiver) = channel();
    operations.register_listener(Arc::new(listener), Interest::all());
    if simulation.trace_events {
        operations.register_listener(Arc::new(TracingListener), Interest::all());
    }

    info!(tasks = simulation.tasks, "starting simulated build");
    let builder = Arc::clone(&operations);
    let build = tokio::task::spawn_blocking(move || {
        let report = drive(&builder, simulation);
        // closes the channel once the build is over
        let session = builder.end_build();
        (report, session)
    });

    let mut printer = EventPrinter::new(json);
    let (report, session) = pump_events(build, receiver, &mut printer).await?;
    let queue = report?;
    if session.still_running > 0 {
        warn!(
            still_running = session.still_running,
            "simulation left operations running"
        );
    }

    let finished = [
        OperationStatus::Succeeded,
        OperationStatus::FailedExpectedly,
        OperationStatus::Failed,
    ]
    .into_iter()
    .map(|status| (status, printer.finished(status)))
    .collect();

    Ok(SimulationReport {
        queue,
        session,
        events: printer.received(),
        finished,
    })
}

/// Print events concurrently with the build, then drain what is left
async fn pump_events<T>(
    mut build: tokio::task::JoinHandle<T>,
    mut receiver: EventReceiver,
    printer: &mut EventPrinter,
) -> Result<T, CliError> {
    loop {
        select! {
            result = &mut build => {
                let result = result?;
                while let Some(message) = receiver.recv().await {
                    printer.handle_event(&message);
                }
                return Ok(result);
            }

            message = receiver.recv() => {
                match message {
                    Some(message) => printer.handle_event(&message),
                    // channel closed: nothing more to print
                    None => return Ok((&mut build).await?),
                }
            }
        }
    }
}

fn drive(operations: &BuildOperations, simulation: Simulation) -> Result<QueueReport, Error> {
    let items = (0..simulation.tasks).map(|index| {
        (
            OperationDescriptor::builder(OperationKind::Task, format!("compile task-{index}"))
                .progress_display_name(format!("task-{index}"))
                .details(serde_json::json!({ "index": index })),
            index,
        )
    });

    operations.run_all(
        OperationDescriptor::builder(OperationKind::Build, "simulated build"),
        items,
        |ctx, index| run_task(ctx, simulation, index),
    )
}

fn run_task(ctx: &mut OperationContext<'_>, simulation: Simulation, index: usize) -> Result<(), Error> {
    let operations = ctx.operations();
    ctx.progress("resolving inputs")?;

    operations.run(
        OperationDescriptor::builder(OperationKind::Network, format!("fetch sources for task-{index}")),
        |fetch| {
            fetch.progress("downloading")?;
            pause(index);
            fetch.set_result(serde_json::json!({ "bytes": 1024 * (index + 1) }));
            Ok::<_, Error>(())
        },
    )?;

    if let Some(failure) = simulation.failure_for(index) {
        return Err(failure.into());
    }

    operations.run(
        OperationDescriptor::builder(OperationKind::File, format!("write task-{index}.o")),
        |write| {
            pause(index + 1);
            write.progress("written")?;
            Ok::<_, Error>(())
        },
    )?;

    ctx.set_result(serde_json::json!({ "artifact": format!("task-{index}.o") }));
    Ok(())
}

fn pause(seed: usize) {
    std::thread::sleep(Duration::from_millis(1 + u64::try_from(seed % 4).unwrap_or(0)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_alternate_between_expected_and_unexpected() {
        let simulation = Simulation {
            tasks: 6,
            fail_every: Some(2),
            trace_events: false,
        };
        assert!(simulation.failure_for(0).is_none());
        assert!(matches!(
            simulation.failure_for(1),
            Some(BuildError::ValidationFailed { .. })
        ));
        assert!(matches!(
            simulation.failure_for(3),
            Some(BuildError::Internal { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn simulation_reports_every_task() {
        let mut config = Config::default();
        config.queue.max_workers = 2;
        let simulation = Simulation {
            tasks: 4,
            fail_every: Some(2),
            trace_events: false,
        };
        let report = run(&config, simulation, true).await.unwrap();

        assert_eq!(report.queue.total(), 4);
        assert_eq!(report.queue.succeeded, 2);
        assert_eq!(report.queue.failed_expectedly, 1);
        assert_eq!(report.queue.failed, 1);
        assert_eq!(report.queue.status, OperationStatus::Failed);
        assert_eq!(report.session.still_running, 0);
        // 4 fetches + 2 writes + 4 tasks + 1 build
        let finished: usize = report.finished.iter().map(|(_, n)| n).sum();
        assert_eq!(finished, 11);
        assert_eq!(report.to_json()["tasks"], 4);
    }

    #[tokio::test]
    async fn pump_waits_for_build_after_channel_closes() {
        let (listener, receiver) = channel();
        drop(listener);
        let build = tokio::spawn(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            7
        });

        let mut printer = EventPrinter::new(false);
        let result = pump_events(build, receiver, &mut printer).await.unwrap();
        assert_eq!(result, 7);
        assert_eq!(printer.received(), 0);
    }
}
