use super::LogError;
use super::buffer::PAGE_DATA_WORDS;

/// The most padding placing an entry of `words` can write ahead of it.
///
/// An entry only pads the producer page when it does not fit the remainder
/// of the page, so the padding is always shorter than the entry.
#[inline]
pub(crate) fn padding_allowance(words: u64) -> u64 {
    words.saturating_sub(1).min(PAGE_DATA_WORDS as u64 - 1)
}

#[derive(Debug, Clone, Eq, PartialEq)]
/// The log space accounting of a logfile group.
///
/// Every word of the ring is either free, reserved by a client that has not
/// yet added its entry, or used by log data between the tail and the producer:
///
/// `free_words + reserved_words + used_words == total_words`
///
/// A reservation also holds the padding its entry may need, the unused
/// part is returned once the entry is placed.
pub(crate) struct LogSpace {
    total_words: u64,
    /// Signed so a violated invariant can be observed instead of wrapping.
    free_words: i64,
    reserved_words: u64,
}

impl LogSpace {
    pub(crate) fn new(total_words: u64, used_words: u64) -> Self {
        Self {
            total_words,
            free_words: total_words as i64 - used_words as i64,
            reserved_words: 0,
        }
    }

    #[inline]
    pub(crate) fn total_words(&self) -> u64 {
        self.total_words
    }

    #[inline]
    pub(crate) fn free_words(&self) -> i64 {
        self.free_words
    }

    #[inline]
    pub(crate) fn reserved_words(&self) -> u64 {
        self.reserved_words
    }

    /// The amount of free space an abortable allocation must leave behind.
    pub(crate) fn abortable_limit(&self, node_restart: bool) -> u64 {
        if node_restart {
            self.total_words / 4
        } else {
            self.total_words / 3
        }
    }

    /// Reserve log space for an entry of `words`.
    ///
    /// Abortable operations are refused once the free space would fall below
    /// the reserve kept for non-abortable work.
    pub(crate) fn alloc(
        &mut self,
        words: u64,
        abortable: bool,
        node_restart: bool,
    ) -> Result<(), LogError> {
        let reservation = words + padding_allowance(words);
        let required = if abortable {
            reservation + self.abortable_limit(node_restart)
        } else {
            reservation
        };

        if self.free_words < required as i64 {
            return Err(LogError::OutOfLogSpace);
        }

        self.free_words -= reservation as i64;
        self.reserved_words += reservation;
        Ok(())
    }

    /// Return the reservation of an entry that will not be added.
    pub(crate) fn release(&mut self, words: u64) -> Result<(), LogError> {
        let reservation = self.check_reserved(words)?;
        self.reserved_words -= reservation;
        self.free_words += reservation as i64;
        Ok(())
    }

    /// Check the reservation of an entry of `words` is held, returning its size.
    pub(crate) fn check_reserved(&self, words: u64) -> Result<u64, LogError> {
        let reservation = words + padding_allowance(words);
        if self.reserved_words < reservation {
            return Err(LogError::SpaceNotAllocated {
                requested: words,
                reserved: self.reserved_words,
            });
        }
        Ok(reservation)
    }

    /// Consume the reservation of an entry of `words` that has been written
    /// to the log after `padding` words.
    pub(crate) fn consume(&mut self, words: u64, padding: u64) {
        let allowance = padding_allowance(words);
        debug_assert!(padding <= allowance);
        debug_assert!(self.reserved_words >= words + allowance);
        self.reserved_words -= words + allowance;
        self.free_words += allowance as i64 - padding as i64;
    }

    /// Charge padding words written outside of any reservation.
    pub(crate) fn charge(&mut self, words: u64) {
        self.free_words -= words as i64;
    }

    /// Return words released by cutting the log tail.
    pub(crate) fn credit(&mut self, words: u64) {
        self.free_words += words as i64;
    }

    /// Check the accounting invariant against the words used by log data.
    pub(crate) fn validate(&self, used_words: u64) -> Result<(), AccountingError> {
        let accounted = self.free_words + self.reserved_words as i64 + used_words as i64;
        if accounted != self.total_words as i64 {
            return Err(AccountingError::LogSpace {
                free: self.free_words,
                reserved: self.reserved_words,
                used: used_words,
                total: self.total_words,
            });
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
/// The space accounting of the logfile group does not add up.
pub enum AccountingError {
    #[error(
        "log space mismatch free={free} reserved={reserved} used={used} total={total}"
    )]
    /// The log space does not balance.
    LogSpace {
        /// The free words.
        free: i64,
        /// The reserved words.
        reserved: u64,
        /// The words used by log data.
        used: u64,
        /// The total words of the ring.
        total: u64,
    },
    #[error(
        "log buffer mismatch free={free} reserved={reserved} unwritten={unwritten} capacity={capacity}"
    )]
    /// The log buffer does not balance.
    Buffer {
        /// The free words.
        free: usize,
        /// The reserved words.
        reserved: usize,
        /// The unwritten words.
        unwritten: usize,
        /// The buffer capacity.
        capacity: usize,
    },
    #[error("{used} used pages exceed the ring of {total} pages")]
    /// The producer has lapped the tail.
    Overrun {
        /// The pages used.
        used: u64,
        /// The pages in the ring.
        total: u64,
    },
}

#[cfg(all(test, not(feature = "test-miri")))]
mod tests {
    use super::*;

    #[rstest::rstest]
    #[case::abortable_under_limit(1200, 100, true, false, true)]
    #[case::abortable_over_limit(1200, 850, true, false, false)]
    #[case::abortable_node_restart(1200, 450, true, true, true)]
    #[case::abortable_without_node_restart(1200, 450, true, false, false)]
    #[case::non_abortable_uses_reserve(1200, 600, false, false, true)]
    #[case::non_abortable_over_total(1200, 601, false, false, false)]
    fn test_alloc_limits(
        #[case] total: u64,
        #[case] words: u64,
        #[case] abortable: bool,
        #[case] node_restart: bool,
        #[case] expect_ok: bool,
    ) {
        let mut space = LogSpace::new(total, 0);
        let result = space.alloc(words, abortable, node_restart);
        assert_eq!(result.is_ok(), expect_ok, "unexpected result: {result:?}");
        space.validate(0).expect("accounting must balance");
    }

    #[test]
    fn test_release_more_than_reserved() {
        let mut space = LogSpace::new(100, 0);
        space.alloc(10, false, false).unwrap();
        let err = space.release(11).unwrap_err();
        assert!(matches!(err, LogError::SpaceNotAllocated { requested: 11, reserved: 19 }));
        space.release(10).unwrap();
        assert_eq!(space.free_words(), 100);
    }

    #[test]
    fn test_consume_and_credit_balance() {
        let mut space = LogSpace::new(100, 0);
        space.alloc(10, false, false).unwrap();
        space.consume(10, 5);
        space.validate(15).unwrap();
        space.credit(15);
        space.validate(0).unwrap();
        assert!(space.validate(1).is_err());
    }

    #[rstest::rstest]
    #[case::small_entry(10, 9)]
    #[case::single_word(1, 0)]
    #[case::full_page(PAGE_DATA_WORDS as u64, PAGE_DATA_WORDS as u64 - 1)]
    fn test_padding_allowance(#[case] words: u64, #[case] expected: u64) {
        assert_eq!(padding_allowance(words), expected);
    }

    #[test]
    fn test_outstanding_padding_stays_within_reservations() {
        let mut space = LogSpace::new(40, 0);
        space.alloc(10, false, false).unwrap();
        space.alloc(10, false, false).unwrap();
        space.alloc(1, false, false).unwrap();
        assert_eq!(space.free_words(), 1);
        assert!(matches!(space.alloc(2, false, false), Err(LogError::OutOfLogSpace)));

        // Both entries pad the page ahead of them by the most they can.
        space.consume(10, 9);
        space.consume(10, 9);
        assert_eq!(space.free_words(), 1);
        space.validate(38).unwrap();

        space.consume(1, 0);
        assert_eq!(space.free_words(), 1);
        space.validate(39).unwrap();
    }
}
