use anyhow::{anyhow, Result};
use chrono::Local;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info};

use super::{StartError, StatusPanel, Tracker};

const COMMAND_BUFFER: usize = 8;

pub enum Command {
    Start {
        plate: String,
        reply: oneshot::Sender<Result<(), StartError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front end to a running [`TrackerService`].
#[derive(Clone)]
pub struct TrackerHandle {
    commands: mpsc::Sender<Command>,
    panel: watch::Receiver<StatusPanel>,
}

impl TrackerHandle {
    pub async fn start(&self, plate: &str) -> Result<(), StartError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Start {
                plate: plate.to_string(),
                reply,
            })
            .await
            .map_err(|_| StartError::Unavailable)?;
        response.await.map_err(|_| StartError::Unavailable)?
    }

    pub async fn stop(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Stop { reply })
            .await
            .map_err(|_| anyhow!("Tracker service is not running"))?;
        response
            .await
            .map_err(|_| anyhow!("Tracker service stopped before answering"))
    }

    pub fn status(&self) -> StatusPanel {
        self.panel.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusPanel> {
        self.panel.clone()
    }
}

/// Owns the tracker and feeds it commands and samples from a single task.
pub struct TrackerService {
    tracker: Tracker,
    commands: mpsc::Receiver<Command>,
}

impl TrackerService {
    pub fn new(tracker: Tracker, panel: watch::Receiver<StatusPanel>) -> (Self, TrackerHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        (
            Self {
                tracker,
                commands: rx,
            },
            TrackerHandle {
                commands: tx,
                panel,
            },
        )
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!("Tracker service running");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutting down tracker service...");
                    break;
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All tracker handles dropped");
                        break;
                    }
                },
                sample = self.tracker.next_sample() => match sample {
                    Some(sample) => {
                        self.tracker.handle_sample(sample, Local::now());
                    }
                    None => self.tracker.end_of_stream(),
                },
            }
        }
        self.tracker.stop();
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { plate, reply } => {
                let result = self.tracker.start(&plate).await;
                let _ = reply.send(result);
            }
            Command::Stop { reply } => {
                self.tracker.stop();
                let _ = reply.send(());
            }
        }
    }
}
