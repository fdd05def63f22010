//! Named inter-stage channels.
//!
//! Stages find each other by pipe name (`video-0`, `filter-0`, …) rather
//! than by reference. Whichever side asks first creates the pipe; a pipe
//! has many senders and exactly one receiver.

use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::error::GaError;
use crate::stages::types::MediaUnit;

/// Frames buffered per pipe before senders see back-pressure.
pub const PIPE_CAPACITY: usize = 8;

pub type PipeSender = mpsc::Sender<MediaUnit>;
pub type PipeReceiver = mpsc::Receiver<MediaUnit>;

struct Pipe {
    tx: PipeSender,
    rx: Option<PipeReceiver>,
}

impl Pipe {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(PIPE_CAPACITY);
        Self { tx, rx: Some(rx) }
    }
}

/// Registry of named pipes shared during stage initialisation.
#[derive(Default)]
pub struct PipeRegistry {
    pipes: HashMap<String, Pipe>,
}

impl PipeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sender for `name`, creating the pipe if needed.
    pub fn sender(&mut self, name: &str) -> PipeSender {
        self.pipes
            .entry(name.to_string())
            .or_insert_with(Pipe::new)
            .tx
            .clone()
    }

    /// Take the single receiver for `name`, creating the pipe if needed.
    pub fn take_receiver(&mut self, name: &str) -> Result<PipeReceiver, GaError> {
        self.pipes
            .entry(name.to_string())
            .or_insert_with(Pipe::new)
            .rx
            .take()
            .ok_or_else(|| GaError::Other(format!("pipe {name} already has a reader")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.pipes.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.pipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::types::{AudioChunk, MediaUnit};
    use std::time::Instant;

    fn chunk() -> MediaUnit {
        MediaUnit::Audio(AudioChunk {
            sample_rate: 48_000,
            channels: 2,
            samples: vec![1, 2],
            timestamp: Instant::now(),
        })
    }

    #[tokio::test]
    async fn reader_first_or_writer_first() {
        let mut pipes = PipeRegistry::new();
        let mut rx = pipes.take_receiver("a").unwrap();
        let tx = pipes.sender("a");
        tx.send(chunk()).await.unwrap();
        assert!(matches!(rx.recv().await, Some(MediaUnit::Audio(_))));

        let tx = pipes.sender("b");
        let mut rx = pipes.take_receiver("b").unwrap();
        tx.send(chunk()).await.unwrap();
        assert!(rx.recv().await.is_some());
        assert_eq!(pipes.len(), 2);
    }

    #[test]
    fn full_pipe_applies_back_pressure() {
        let mut pipes = PipeRegistry::new();
        let tx = pipes.sender("stream-0");
        let mut rx = pipes.take_receiver("stream-0").unwrap();
        for _ in 0..PIPE_CAPACITY {
            tokio_test::assert_ok!(tx.try_send(chunk()));
        }

        let mut send = tokio_test::task::spawn(tx.send(chunk()));
        tokio_test::assert_pending!(send.poll());
        assert!(rx.try_recv().is_ok());
        assert!(send.is_woken());
        tokio_test::assert_ready_ok!(send.poll());
    }

    #[test]
    fn second_reader_is_rejected() {
        let mut pipes = PipeRegistry::new();
        let _rx = pipes.take_receiver("video-0").unwrap();
        assert!(pipes.take_receiver("video-0").is_err());
        assert!(pipes.contains("video-0"));
    }
}
