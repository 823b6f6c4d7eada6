//! Status fan-out: a broker task with explicit start/stop, and a console
//! progress board.

use std::{collections::HashMap, sync::Arc, sync::Mutex};

use gym_config::ExperimentId;
use gym_training::{JobStatus, StatusEvent, StatusSink};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::{sync::mpsc, task::JoinHandle};

enum BrokerMessage {
    Event(StatusEvent),
    Stop,
}

/// Forwards status events to subscribers on a background task.
///
/// Publishers get a cheap [`BrokerSink`] handle; publishing never blocks.
/// [`StatusBroker::stop`] delivers every event published before it, then
/// ends the task. Events published after `stop` are dropped.
pub struct StatusBroker {
    tx: mpsc::UnboundedSender<BrokerMessage>,
    task: JoinHandle<()>,
}

impl StatusBroker {
    /// Spawn the broker task. Must be called inside a tokio runtime.
    #[must_use]
    pub fn start(subscribers: Vec<Arc<dyn StatusSink>>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    BrokerMessage::Event(event) => {
                        for subscriber in &subscribers {
                            subscriber.publish(event.clone());
                        }
                    }
                    BrokerMessage::Stop => break,
                }
            }
            tracing::debug!("status broker stopped");
        });
        Self { tx, task }
    }

    #[must_use]
    pub fn sink(&self) -> BrokerSink {
        BrokerSink {
            tx: self.tx.clone(),
        }
    }

    pub async fn stop(self) {
        let _ = self.tx.send(BrokerMessage::Stop);
        if let Err(e) = self.task.await {
            tracing::warn!("status broker task ended abnormally: {}", e);
        }
    }
}

/// Publishing handle of a [`StatusBroker`].
#[derive(Clone)]
pub struct BrokerSink {
    tx: mpsc::UnboundedSender<BrokerMessage>,
}

impl StatusSink for BrokerSink {
    fn publish(&self, event: StatusEvent) {
        // Delivery is best effort.
        let _ = self.tx.send(BrokerMessage::Event(event));
    }
}

/// One progress bar per running job.
pub struct ProgressBoard {
    multi: MultiProgress,
    bars: Mutex<HashMap<ExperimentId, ProgressBar>>,
}

impl ProgressBoard {
    #[must_use]
    pub fn new(multi: MultiProgress) -> Self {
        Self {
            multi,
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn bar_style() -> ProgressStyle {
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] {msg:42} [{wide_bar:.cyan/blue}] {pos:>4}/{len:4} ({percent:>2}%) [{eta:>5}]",
            )
            .map(|style| style.progress_chars("#*-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar())
    }
}

impl StatusSink for ProgressBoard {
    fn publish(&self, event: StatusEvent) {
        let Ok(mut bars) = self.bars.lock() else {
            return;
        };
        match event {
            StatusEvent::JobStatus {
                experiment_id,
                status: JobStatus::Running,
                ..
            } => {
                let pb = self.multi.add(ProgressBar::new(0));
                pb.set_style(Self::bar_style());
                pb.set_message(format!("{experiment_id:30}: running"));
                pb.enable_steady_tick(std::time::Duration::from_millis(100));
                bars.insert(experiment_id, pb);
            }
            StatusEvent::JobStatus {
                experiment_id,
                status,
                epoch,
            } if status.is_terminal() => {
                if let Some(pb) = bars.remove(&experiment_id) {
                    pb.finish_with_message(format!("{experiment_id:30}: {status} (epoch {epoch})"));
                }
            }
            StatusEvent::Progress {
                experiment_id,
                epoch,
                num_epochs,
            } => {
                if let Some(pb) = bars.get(&experiment_id) {
                    pb.set_length(num_epochs);
                    pb.set_position(epoch);
                    pb.set_message(format!("{experiment_id:30}: epoch {epoch:3}/{num_epochs:3}"));
                }
            }
            StatusEvent::JobStatus { .. } | StatusEvent::Evaluation { .. } => {}
        }
    }
}
