// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The rendezvous channel between the characteristic dispatch task and the
//! protocol driver task: the driver sends an outbound message and blocks
//! for an acknowledgement; the characteristic delivers an inbound message
//! and blocks for the driver's acknowledgement. Modeled as two capacity-1
//! channels carrying a small `PipeMsg` enum, with the acknowledgement
//! itself crossing on the channel running the other way. Closing either
//! sender is the canonical "fatal error, unwind" signal for both sides.

use tokio::sync::mpsc;

#[derive(Debug)]
enum PipeMsg {
    Data(Vec<u8>),
    Ack,
}

/// Held by the protocol driver task.
pub struct DriverEnd {
    to_char: mpsc::Sender<PipeMsg>,
    from_char: mpsc::Receiver<PipeMsg>,
}

/// Held by the characteristic dispatch task.
pub struct CharEnd {
    to_driver: mpsc::Sender<PipeMsg>,
    from_driver: mpsc::Receiver<PipeMsg>,
}

/// Creates a connected pipe pair.
pub fn pipe() -> (DriverEnd, CharEnd) {
    let (driver_tx, driver_rx) = mpsc::channel(1);
    let (char_tx, char_rx) = mpsc::channel(1);
    (
        DriverEnd {
            to_char: driver_tx,
            from_char: char_rx,
        },
        CharEnd {
            to_driver: char_tx,
            from_driver: driver_rx,
        },
    )
}

impl DriverEnd {
    /// Sends an outbound message and waits for the characteristic's
    /// acknowledgement that it has been fully delivered to the client.
    pub async fn send(&mut self, msg: Vec<u8>) -> Option<()> {
        self.to_char.send(PipeMsg::Data(msg)).await.ok()?;
        match self.from_char.recv().await {
            Some(PipeMsg::Ack) => Some(()),
            _ => None,
        }
    }

    /// Waits for a complete inbound message, then acknowledges it.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        match self.from_char.recv().await {
            Some(PipeMsg::Data(buf)) => {
                self.to_char.send(PipeMsg::Ack).await.ok()?;
                Some(buf)
            }
            _ => None,
        }
    }
}

impl CharEnd {
    /// Blocks until the driver has an outbound message ready, returning it.
    pub async fn request_outbound(&mut self) -> Option<Vec<u8>> {
        match self.from_driver.recv().await {
            Some(PipeMsg::Data(buf)) => Some(buf),
            _ => None,
        }
    }

    /// Acknowledges that an outbound message has been fully sent to the
    /// client, waking the driver's `send`.
    pub fn finish_outbound(&self) {
        let _ = self.to_driver.try_send(PipeMsg::Ack);
    }

    /// Delivers a complete inbound message to the driver and waits for its
    /// acknowledgement before the characteristic may start a new operation.
    pub async fn deliver_inbound(&mut self, buf: Vec<u8>) -> Option<()> {
        self.to_driver.send(PipeMsg::Data(buf)).await.ok()?;
        match self.from_driver.recv().await {
            Some(PipeMsg::Ack) => Some(()),
            _ => None,
        }
    }

    /// Closes the pipe, the canonical fatal-error signal: the driver's
    /// next `send`/`recv` observes a closed channel and unwinds.
    pub fn close(&mut self) {
        let (tx, _rx) = mpsc::channel(1);
        self.to_driver = tx;
    }
}

impl DriverEnd {
    /// Closes the pipe from the driver side, the canonical fatal-error
    /// signal for protocol-layer failures.
    pub fn close(&mut self) {
        let (tx, _rx) = mpsc::channel(1);
        self.to_char = tx;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn outbound_roundtrip() {
        let (mut driver, mut ch) = pipe();
        let driver_task = tokio::spawn(async move {
            driver.send(b"hello".to_vec()).await.unwrap();
        });
        let buf = ch.request_outbound().await.unwrap();
        assert_eq!(buf, b"hello");
        ch.finish_outbound();
        driver_task.await.unwrap();
    }

    #[tokio::test]
    async fn inbound_roundtrip() {
        let (mut driver, mut ch) = pipe();
        let ch_task = tokio::spawn(async move {
            ch.deliver_inbound(b"world".to_vec()).await.unwrap();
        });
        let buf = driver.recv().await.unwrap();
        assert_eq!(buf, b"world");
        ch_task.await.unwrap();
    }

    #[tokio::test]
    async fn closed_pipe_is_observed_by_driver() {
        let (mut driver, ch) = pipe();
        drop(ch);
        assert!(driver.recv().await.is_none());
    }
}
