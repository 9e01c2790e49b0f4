// This file is part of GridSQL.
//
// Copyright (C) 2022 The GridSQL Authors.
//
// GridSQL is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// GridSQL is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with GridSQL. If not, see <https://www.gnu.org/licenses/>.

//! Bounded mpmc channel built on top of the async-std channel, with
//! synchronous wrappers for use from plain threads.
//!
//! Two producers rely on it: the proof-of-work miner streams candidate
//! nonces through one, and the coordinator collects worker RPC outcomes
//! from its parallel fan-out through another.

use async_std::{
    channel::{
        self as async_channel, Receiver as AsyncReceiver, Sender as AsyncSender, TryRecvError,
    },
    task,
};
use std::{fmt::Display, time::Duration};

/// Upper bound to outstanding channel elements.
const CHANNEL_BOUND: usize = 1000;

/// Errors which can be triggered by a channel.
#[derive(Debug, PartialEq)]
pub enum ChannelError {
    /// Error during send. Broken channel.
    SendError,
    /// Error during receive. Broken channel.
    RecvError,
    /// Timeout during receive.
    RecvTimeout,
}

impl std::error::Error for ChannelError {}

impl Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            ChannelError::SendError => "channel send error",
            ChannelError::RecvError => "channel recv error",
            ChannelError::RecvTimeout => "channel recv timeout",
        };
        write!(f, "{}", msg)
    }
}

/// Creates a simple mpmc channel.
pub fn simple_channel<T>() -> (Sender<T>, Receiver<T>) {
    let (sender, receiver) = async_channel::bounded::<T>(CHANNEL_BOUND);
    (Sender(sender), Receiver(receiver))
}

/// Channel sender side.
#[derive(Clone)]
pub struct Sender<T>(AsyncSender<T>);

impl<T> Sender<T> {
    /// Push one element into the channel.
    pub async fn send(&self, value: T) -> Result<(), ChannelError> {
        self.0.send(value).await.map_err(|_| ChannelError::SendError)
    }

    /// Push one element, synchronous wrapper.
    pub fn send_sync(&self, value: T) -> Result<(), ChannelError> {
        task::block_on(self.send(value))
    }

    /// Closes the channel.
    /// Returns true if this call has closed the channel and it was not closed already.
    /// The remaining messages can still be received.
    pub fn close(&self) -> bool {
        self.0.close()
    }

    /// Returns true if the channel is closed.
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// Channel receiver side.
#[derive(Clone)]
pub struct Receiver<T>(AsyncReceiver<T>);

impl<T> Receiver<T> {
    /// Collect one element.
    ///
    /// This call is blocking.
    pub async fn recv(&self) -> Result<T, ChannelError> {
        self.0.recv().await.map_err(|_| ChannelError::RecvError)
    }

    /// Collect one element with timeout.
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<T, ChannelError> {
        let mut timeout = timeout;
        let sleep_time = Duration::from_millis(100);
        loop {
            match self.0.try_recv() {
                Ok(res) => return Ok(res),
                Err(TryRecvError::Empty) if timeout > Duration::from_millis(0) => {
                    task::sleep(sleep_time).await;
                    timeout = timeout
                        .checked_sub(sleep_time)
                        .unwrap_or_else(|| Duration::from_millis(0));
                }
                Err(TryRecvError::Empty) => return Err(ChannelError::RecvTimeout),
                _ => return Err(ChannelError::RecvError),
            }
        }
    }

    /// Collect one element, synchronous wrapper.
    pub fn recv_sync(&self) -> Result<T, ChannelError> {
        task::block_on(self.recv())
    }

    /// Collect one element with timeout, synchronous wrapper.
    pub fn recv_timeout_sync(&self, timeout: Duration) -> Result<T, ChannelError> {
        task::block_on(self.recv_timeout(timeout))
    }

    /// Closes the channel.
    /// Returns true if this call has closed the channel and it was not closed already.
    /// The remaining messages can still be received.
    pub fn close(&self) -> bool {
        self.0.close()
    }

    /// Returns true if the channel is closed.
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const TIMEOUT_DURATION: Duration = Duration::from_secs(1);

    #[test]
    fn send_recv() {
        let (tx_chan, rx_chan) = simple_channel::<u32>();

        tx_chan.send_sync(3).unwrap();
        let val = rx_chan.recv_sync().unwrap();

        assert_eq!(val, 3);
    }

    #[test]
    fn send_closed_receiver() {
        let (tx_chan, _) = simple_channel::<()>();

        let err = tx_chan.send_sync(()).unwrap_err();

        assert_eq!(err, ChannelError::SendError);
    }

    #[test]
    fn recv_closed_sender() {
        let (_, rx_chan) = simple_channel::<()>();

        let err = rx_chan.recv_sync().unwrap_err();

        assert_eq!(err, ChannelError::RecvError);
    }

    #[test]
    fn recv_with_timeout() {
        let (_tx_chan, rx_chan) = simple_channel::<()>();

        let err = rx_chan.recv_timeout_sync(TIMEOUT_DURATION).unwrap_err();

        assert_eq!(err, ChannelError::RecvTimeout);
    }

    #[test]
    fn close_marks_both_sides() {
        let (tx_chan, rx_chan) = simple_channel::<u32>();

        tx_chan.send_sync(7).unwrap();
        assert!(rx_chan.close());

        // Outstanding elements are still delivered after close.
        assert_eq!(rx_chan.recv_sync().unwrap(), 7);
        assert!(tx_chan.is_closed());
    }
}
