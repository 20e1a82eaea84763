//! Two-slot send exchange
//!
//! Producers append to a staging list while the previous batch is in flight.
//! Whoever finds the exchange idle becomes the sender: it takes the staged
//! batch, ships it outside any lock and calls [`SendExchange::finish`] when the
//! transport completes. Only one pipeline runs at a time.

use core::mem;

/// Staging + in-flight buffer pair guarded by the owner's lock
#[derive(Debug)]
pub struct SendExchange<T> {
    staging: Vec<T>,
    spare: Vec<T>,
    tx_flag: bool,
}

impl<T> Default for SendExchange<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SendExchange<T> {
    pub fn new() -> Self {
        Self {
            staging: Vec::new(),
            spare: Vec::new(),
            tx_flag: false,
        }
    }

    /// Stage `item`. Returns `true` when the caller must start the pipeline.
    pub fn push(&mut self, item: T) -> bool {
        self.staging.push(item);
        self.claim()
    }

    /// Swap the slots and hand the staged batch to the running pipeline
    pub fn begin(&mut self) -> Vec<T> {
        let mut batch = mem::take(&mut self.spare);
        mem::swap(&mut batch, &mut self.staging);
        batch
    }

    /// Return the drained batch vector. Returns `true` if more items were
    /// staged meanwhile and the pipeline must run again; otherwise the
    /// exchange goes idle.
    pub fn finish(&mut self, mut batch: Vec<T>) -> bool {
        batch.clear();
        self.spare = batch;
        if self.staging.is_empty() {
            self.tx_flag = false;
            false
        } else {
            true
        }
    }

    /// Whether a pipeline is running
    pub fn is_sending(&self) -> bool {
        self.tx_flag
    }

    pub fn staged_len(&self) -> usize {
        self.staging.len()
    }

    /// Drop the pipeline claim and return everything still staged
    pub fn reset(&mut self) -> Vec<T> {
        self.tx_flag = false;
        self.spare.clear();
        mem::take(&mut self.staging)
    }

    fn claim(&mut self) -> bool {
        if self.tx_flag {
            false
        } else {
            self.tx_flag = true;
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_first_push_starts_pipeline() {
        let mut exchange = SendExchange::new();
        assert!(exchange.push(1));
        assert!(!exchange.push(2));
        assert!(exchange.is_sending());

        let batch = exchange.begin();
        assert_eq!(batch, vec![1, 2]);
        assert!(!exchange.push(3));
        assert_eq!(exchange.staged_len(), 1);

        assert!(exchange.finish(batch));
        assert_eq!(exchange.begin(), vec![3]);
    }

    #[test]
    fn test_finish_goes_idle_when_nothing_staged() {
        let mut exchange = SendExchange::new();
        exchange.push("a");
        let batch = exchange.begin();
        assert!(!exchange.finish(batch));
        assert!(!exchange.is_sending());
        assert!(exchange.push("b"));
    }

    #[test]
    fn test_reset_returns_staged_items() {
        let mut exchange = SendExchange::new();
        exchange.push(1);
        exchange.push(2);
        assert_eq!(exchange.reset(), vec![1, 2]);
        assert!(!exchange.is_sending());
    }
}
