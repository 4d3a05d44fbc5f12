//! Fault-injecting transport for tests.
//!
//! Real networks drop, reorder, and duplicate packets.  [`LossyTransport`]
//! wraps any [`Transport`] and applies a seeded fault model to everything it
//! sends, so the reliability machinery can be exercised on loopback with
//! reproducible results:
//!
//! | Fault       | Effect                                                  |
//! |-------------|---------------------------------------------------------|
//! | Loss        | Drop the datagram with probability `loss_rate`.         |
//! | Duplication | Send the datagram twice with probability `duplicate_rate`. |
//! | Reordering  | With probability `reorder_rate`, hold the datagram back |
//! |             | and send it after the next one.                         |
//!
//! Faults apply on the sending side only; receiving passes straight through.

use std::io;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::socket::Transport;

/// Fault probabilities, each in `[0.0, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorConfig {
    pub loss_rate: f64,
    pub duplicate_rate: f64,
    pub reorder_rate: f64,
    /// Seed for the fault RNG.
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // A transparent pass-through.
        Self {
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            reorder_rate: 0.0,
            seed: 0,
        }
    }
}

#[derive(Debug, Default, PartialEq)]
struct Faults {
    lose: bool,
    duplicate: bool,
    reorder: bool,
}

/// A [`Transport`] that loses, duplicates, and reorders what it sends.
#[derive(Debug)]
pub struct LossyTransport<T> {
    inner: T,
    config: SimulatorConfig,
    rng: Mutex<StdRng>,
    /// A datagram held back for reordering.
    held: Mutex<Option<(Vec<u8>, SocketAddr)>>,
}

impl<T: Transport> LossyTransport<T> {
    /// Rates outside `[0.0, 1.0]` are clamped.
    pub fn new(inner: T, config: SimulatorConfig) -> Self {
        let config = SimulatorConfig {
            loss_rate: config.loss_rate.clamp(0.0, 1.0),
            duplicate_rate: config.duplicate_rate.clamp(0.0, 1.0),
            reorder_rate: config.reorder_rate.clamp(0.0, 1.0),
            seed: config.seed,
        };
        Self {
            inner,
            rng: Mutex::new(StdRng::seed_from_u64(config.seed)),
            config,
            held: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    fn roll(&self) -> Faults {
        let mut rng = lock(&self.rng);
        Faults {
            lose: rng.gen_bool(self.config.loss_rate),
            duplicate: rng.gen_bool(self.config.duplicate_rate),
            reorder: rng.gen_bool(self.config.reorder_rate),
        }
    }
}

fn lock<V>(m: &Mutex<V>) -> MutexGuard<'_, V> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T: Transport> Transport for LossyTransport<T> {
    async fn send_to(&self, buf: &[u8], peer: SocketAddr) -> io::Result<usize> {
        let faults = self.roll();
        if faults.lose {
            log::trace!("[rcp:sim] dropped {} bytes to {peer}", buf.len());
            return Ok(buf.len());
        }
        if faults.reorder {
            log::trace!("[rcp:sim] holding back {} bytes to {peer}", buf.len());
            let previous = lock(&self.held).replace((buf.to_vec(), peer));
            if let Some((bytes, to)) = previous {
                self.inner.send_to(&bytes, to).await?;
            }
            return Ok(buf.len());
        }

        self.inner.send_to(buf, peer).await?;
        if faults.duplicate {
            log::trace!("[rcp:sim] duplicated {} bytes to {peer}", buf.len());
            self.inner.send_to(buf, peer).await?;
        }
        let held = lock(&self.held).take();
        if let Some((bytes, to)) = held {
            self.inner.send_to(&bytes, to).await?;
        }
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}
