use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::config::HostCapacity;
use crate::error::{FarmError, Result};

use super::run_frame::Reservation;

/// Totals currently held by running frames.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReservedTotals {
    pub cores: f32,
    pub memory_kb: u64,
    pub gpu_memory_kb: u64,
    pub frames: usize,
}

/// In-process registry of reservations, keyed by dispatch key.
#[derive(Debug)]
pub struct ReservationBook {
    capacity: HostCapacity,
    entries: Mutex<HashMap<String, Reservation>>,
}

impl ReservationBook {
    pub fn new(capacity: HostCapacity) -> Self {
        Self {
            capacity,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> &HostCapacity {
        &self.capacity
    }

    fn effective_cores(&self, reservation: &Reservation) -> f32 {
        if reservation.cores < 0.0 {
            self.capacity.cores
        } else {
            reservation.cores
        }
    }

    /// Record `reservation` under `key`, refusing duplicates and anything
    /// that would take the host past its capacity.
    pub async fn reserve(&self, key: &str, reservation: Reservation) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(key) {
            return Err(FarmError::DuplicateFrame(key.to_string()));
        }

        let mut totals = ReservedTotals::default();
        for held in entries.values() {
            totals.cores += self.effective_cores(held);
            totals.memory_kb += held.memory_kb;
            totals.gpu_memory_kb += held.gpu_memory_kb;
        }

        let cores = self.effective_cores(&reservation);
        if totals.cores + cores > self.capacity.cores + f32::EPSILON {
            return Err(FarmError::InsufficientResources(format!(
                "{} cores requested, {} of {} in use",
                reservation.cores, totals.cores, self.capacity.cores
            )));
        }
        if totals.memory_kb + reservation.memory_kb > self.capacity.memory_kb {
            return Err(FarmError::InsufficientResources(format!(
                "{} KiB memory requested, {} of {} KiB in use",
                reservation.memory_kb, totals.memory_kb, self.capacity.memory_kb
            )));
        }
        if totals.gpu_memory_kb + reservation.gpu_memory_kb > self.capacity.gpu_memory_kb {
            return Err(FarmError::InsufficientResources(format!(
                "{} KiB GPU memory requested, {} of {} KiB in use",
                reservation.gpu_memory_kb, totals.gpu_memory_kb, self.capacity.gpu_memory_kb
            )));
        }

        entries.insert(key.to_string(), reservation);
        Ok(())
    }

    pub async fn release(&self, key: &str) -> Option<Reservation> {
        self.entries.lock().await.remove(key)
    }

    pub async fn totals(&self) -> ReservedTotals {
        let entries = self.entries.lock().await;
        let mut totals = ReservedTotals {
            frames: entries.len(),
            ..Default::default()
        };
        for held in entries.values() {
            totals.cores += self.effective_cores(held);
            totals.memory_kb += held.memory_kb;
            totals.gpu_memory_kb += held.gpu_memory_kb;
        }
        totals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> ReservationBook {
        ReservationBook::new(HostCapacity {
            cores: 4.0,
            memory_kb: 1024,
            gpu_memory_kb: 0,
        })
    }

    #[tokio::test]
    async fn reserve_within_capacity() {
        let book = book();
        book.reserve("a", Reservation::new(2.0, 512)).await.unwrap();
        book.reserve("b", Reservation::new(2.0, 512)).await.unwrap();
        let totals = book.totals().await;
        assert_eq!(totals.frames, 2);
        assert_eq!(totals.memory_kb, 1024);
    }

    #[tokio::test]
    async fn over_capacity_is_rejected() {
        let book = book();
        book.reserve("a", Reservation::new(3.0, 100)).await.unwrap();
        assert!(matches!(
            book.reserve("b", Reservation::new(2.0, 100)).await,
            Err(FarmError::InsufficientResources(_))
        ));
        assert!(matches!(
            book.reserve("c", Reservation::new(0.0, 2048)).await,
            Err(FarmError::InsufficientResources(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_key_is_rejected() {
        let book = book();
        book.reserve("a", Reservation::default()).await.unwrap();
        assert!(matches!(
            book.reserve("a", Reservation::default()).await,
            Err(FarmError::DuplicateFrame(_))
        ));
        book.release("a").await;
        book.reserve("a", Reservation::default()).await.unwrap();
    }

    #[tokio::test]
    async fn negative_cores_take_the_whole_host() {
        let book = book();
        book.reserve("all", Reservation::new(-1.0, 0)).await.unwrap();
        assert!(book.reserve("one", Reservation::new(1.0, 0)).await.is_err());
        assert!(book.reserve("any", Reservation::new(0.0, 0)).await.is_ok());
    }
}
