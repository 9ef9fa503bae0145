//! Streaming consumers
//!
//! The loop calls [`Streamer::put`] once with the prompt rows, then once per
//! step with the newly selected token of every row, and [`Streamer::end`]
//! when generation halts.

use crate::error::{GenerationError, Result};
use tokio::sync::mpsc;

pub trait Streamer: Send {
    fn put(&mut self, tokens: &[Vec<i64>]) -> Result<()>;

    fn end(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Tokens(Vec<Vec<i64>>),
    End,
}

/// Forwards events over an unbounded tokio channel.
pub struct ChannelStreamer {
    sender: mpsc::UnboundedSender<StreamEvent>,
    skip_prompt: bool,
    seen_prompt: bool,
}

impl ChannelStreamer {
    pub fn new(skip_prompt: bool) -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender,
                skip_prompt,
                seen_prompt: false,
            },
            receiver,
        )
    }

    fn send(&self, event: StreamEvent) -> Result<()> {
        self.sender
            .send(event)
            .map_err(|_| GenerationError::Streamer("receiver dropped".to_string()))
    }
}

impl Streamer for ChannelStreamer {
    fn put(&mut self, tokens: &[Vec<i64>]) -> Result<()> {
        if self.skip_prompt && !self.seen_prompt {
            self.seen_prompt = true;
            return Ok(());
        }
        self.seen_prompt = true;
        self.send(StreamEvent::Tokens(tokens.to_vec()))
    }

    fn end(&mut self) -> Result<()> {
        self.send(StreamEvent::End)
    }
}

/// Invokes a closure for every generated step (the prompt is skipped).
pub struct CallbackStreamer<F>
where
    F: FnMut(&[Vec<i64>]) -> Result<()> + Send,
{
    callback: F,
    seen_prompt: bool,
}

impl<F> CallbackStreamer<F>
where
    F: FnMut(&[Vec<i64>]) -> Result<()> + Send,
{
    pub fn new(callback: F) -> Self {
        Self {
            callback,
            seen_prompt: false,
        }
    }
}

impl<F> Streamer for CallbackStreamer<F>
where
    F: FnMut(&[Vec<i64>]) -> Result<()> + Send,
{
    fn put(&mut self, tokens: &[Vec<i64>]) -> Result<()> {
        if !self.seen_prompt {
            self.seen_prompt = true;
            return Ok(());
        }
        (self.callback)(tokens)
    }

    fn end(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_streamer_skips_prompt() {
        let (mut streamer, mut rx) = ChannelStreamer::new(true);
        streamer.put(&[vec![5, 9]]).unwrap();
        streamer.put(&[vec![10]]).unwrap();
        streamer.end().unwrap();

        assert_eq!(rx.recv().await, Some(StreamEvent::Tokens(vec![vec![10]])));
        assert_eq!(rx.recv().await, Some(StreamEvent::End));
    }

    #[test]
    fn test_closed_channel_is_an_error() {
        let (mut streamer, rx) = ChannelStreamer::new(false);
        drop(rx);
        assert!(matches!(
            streamer.put(&[vec![1]]),
            Err(GenerationError::Streamer(_))
        ));
    }

    #[test]
    fn test_callback_streamer() {
        let mut seen = Vec::new();
        {
            let mut streamer = CallbackStreamer::new(|tokens: &[Vec<i64>]| {
                seen.push(tokens[0][0]);
                Ok(())
            });
            streamer.put(&[vec![1, 2, 3]]).unwrap();
            streamer.put(&[vec![4]]).unwrap();
            streamer.put(&[vec![5]]).unwrap();
        }
        assert_eq!(seen, vec![4, 5]);
    }
}
