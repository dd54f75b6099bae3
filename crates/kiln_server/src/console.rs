//! Console input and cross-thread requests.
//!
//! Background threads never touch server state. They push a
//! [`ServerRequest`] and wake the tick thread, which drains the queue in its
//! notifier callback.

use std::io::{self, BufRead, BufReader};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use kiln_core::SleeperNotifier;

/// Work a background thread hands to the tick thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerRequest {
    /// A console command line.
    Command(String),
    /// Stop the server after the current tick.
    Shutdown,
}

/// Sending half of the request queue.
#[derive(Clone, Debug)]
pub struct RequestSender {
    tx: Sender<ServerRequest>,
    notifier: SleeperNotifier,
}

impl RequestSender {
    /// Queues `request` and wakes the tick thread.
    ///
    /// Returns false if the server is gone.
    pub fn send(&self, request: ServerRequest) -> bool {
        if self.tx.send(request).is_err() {
            return false;
        }
        self.notifier.wake_up_sleeper();
        true
    }
}

/// Receiving half, drained on the tick thread.
#[derive(Debug)]
pub struct RequestQueue {
    rx: Receiver<ServerRequest>,
}

impl RequestQueue {
    /// Takes every queued request.
    #[must_use]
    pub fn drain(&self) -> Vec<ServerRequest> {
        self.rx.try_iter().collect()
    }
}

/// Creates a request queue whose sender wakes `notifier`.
#[must_use]
pub fn request_channel(notifier: SleeperNotifier) -> (RequestSender, RequestQueue) {
    let (tx, rx) = unbounded();
    (RequestSender { tx, notifier }, RequestQueue { rx })
}

/// Thread that turns input lines into [`ServerRequest::Command`]s.
#[derive(Debug)]
pub struct ConsoleReader {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ConsoleReader {
    /// Reads lines from `input` until EOF or shutdown.
    pub fn spawn<R>(input: R, sender: RequestSender) -> io::Result<Self>
    where
        R: BufRead + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let thread = thread::Builder::new()
            .name("kiln-console".into())
            .spawn(move || read_lines(input, &sender, &flag))?;
        Ok(Self {
            running,
            thread: Some(thread),
        })
    }

    /// Reads from standard input.
    pub fn stdin(sender: RequestSender) -> io::Result<Self> {
        Self::spawn(BufReader::new(io::stdin()), sender)
    }

    /// Stops forwarding lines.
    ///
    /// A reader blocked on input cannot be interrupted, so it is detached
    /// rather than joined.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.is_finished() {
                if thread.join().is_err() {
                    tracing::warn!("Console reader panicked");
                }
            } else {
                tracing::debug!("Console reader still blocked on input, detaching");
            }
        }
    }
}

impl Drop for ConsoleReader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn read_lines<R: BufRead>(input: R, sender: &RequestSender, running: &AtomicBool) {
    for line in input.lines() {
        if !running.load(Ordering::Acquire) {
            break;
        }
        let line = match line {
            Ok(line) => line,
            Err(error) => {
                tracing::warn!(%error, "Console read failed");
                break;
            }
        };
        let command = line.trim();
        if command.is_empty() {
            continue;
        }
        if !sender.send(ServerRequest::Command(command.to_string())) {
            break;
        }
    }
    tracing::debug!("Console reader finished");
}
