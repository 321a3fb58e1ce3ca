//! Shared flow-control budgets.
//!
//! A budget table is an open-addressed array of fixed-size entries:
//!
//! ```text
//! [ budget_id:i64 | value:i64 | watchers:i64 | attachments:i64 ]  x entries
//! ```
//!
//! `budget_id == 0` marks a free entry. The downstream stage credits a
//! budget when it can accept more data; the upstream stage debits (or
//! claims) before writing and uses only what it was granted. Workers whose
//! claim fell short set their bit in `watchers` so the crediting side knows
//! whom to wake.
//!
//! Budget ids are learned from messages, so the first attach of an id always
//! happens-before every other party's attach. Two parties racing to create
//! the same id is not supported.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};

use crate::error::{LayoutError, check_length, check_power_of_two};
use crate::region::SharedRegion;
use crate::sync::spin_loop;

pub const SIZEOF_BUDGET_ENTRY: usize = 32;

const BUDGET_ID_OFFSET: usize = 0;
const VALUE_OFFSET: usize = 8;
const WATCHERS_OFFSET: usize = 16;
const ATTACHMENTS_OFFSET: usize = 24;

/// Maximum number of distinct watchers (one bit each).
pub const MAX_WATCHERS: u32 = 64;

/// Total region length for a table of `entries` budgets.
pub const fn region_length(entries: usize) -> usize {
    entries * SIZEOF_BUDGET_ENTRY
}

#[inline]
fn hash(budget_id: i64) -> usize {
    let h = (budget_id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    (h ^ (h >> 32)) as usize
}

/// Grant for a claim of `minimum..=maximum` against `available`.
#[inline]
fn grant(available: i64, minimum: i64, maximum: i64) -> i64 {
    if available >= maximum {
        maximum
    } else if available >= minimum {
        available.max(0)
    } else {
        0
    }
}

/// Handle over a shared budget table. Clones share the table.
#[derive(Clone)]
pub struct BudgetTable {
    region: SharedRegion,
    entries: usize,
    floor: i64,
}

impl BudgetTable {
    /// Build a table of `entries` budgets (zero or a power of two) over a
    /// writable region of exactly [`region_length`] bytes.
    pub fn build(entries: usize, region: SharedRegion) -> Result<Self, LayoutError> {
        check_power_of_two("budget entries", entries)?;
        check_length(region_length(entries), region.len())?;
        region.require_writable()?;

        debug!(entries, "built budget table");

        Ok(Self {
            region,
            entries,
            floor: 0,
        })
    }

    /// Debits and claims never take a budget below `floor` (default zero).
    pub fn with_floor(mut self, floor: i64) -> Self {
        self.floor = floor;
        self
    }

    #[inline]
    pub fn entries(&self) -> usize {
        self.entries
    }

    #[inline]
    pub fn floor(&self) -> i64 {
        self.floor
    }

    #[inline]
    fn cell(&self, index: usize, field: usize) -> &AtomicI64 {
        self.region
            .region()
            .atomic_i64(index * SIZEOF_BUDGET_ENTRY + field)
    }

    /// Probe order for `budget_id`: every entry, starting at its hash.
    fn probe(&self, budget_id: i64) -> impl Iterator<Item = usize> + use<> {
        let mask = self.entries.wrapping_sub(1);
        let start = hash(budget_id);
        (0..self.entries).map(move |i| (start + i) & mask)
    }

    /// Index of the live entry for `budget_id`, if any.
    fn lookup(&self, budget_id: i64) -> Option<usize> {
        self.probe(budget_id).find(|&index| {
            self.cell(index, BUDGET_ID_OFFSET).load(Ordering::Acquire) == budget_id
                && self.cell(index, ATTACHMENTS_OFFSET).load(Ordering::Acquire) > 0
        })
    }

    /// Adds one attachment to the entry at `index` if it still belongs to
    /// `budget_id` and is not being torn down.
    fn join(&self, index: usize, budget_id: i64) -> bool {
        let attachments = self.cell(index, ATTACHMENTS_OFFSET);
        let mut current = attachments.load(Ordering::Acquire);
        loop {
            if current <= 0
                || self.cell(index, BUDGET_ID_OFFSET).load(Ordering::Acquire) != budget_id
            {
                return false;
            }
            match attachments.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => {
                    current = actual;
                    spin_loop();
                }
            }
        }
    }

    /// Attach to the budget `budget_id`, creating it with value zero on
    /// first reference. Returns `None` if the table is full.
    ///
    /// # Panics
    ///
    /// If `budget_id` is zero.
    pub fn attach(&self, budget_id: i64) -> Option<Budget> {
        assert_ne!(budget_id, 0, "budget id 0 is reserved");

        if let Some(budget) = self.find(budget_id) {
            return Some(budget);
        }

        for index in self.probe(budget_id) {
            let id = self.cell(index, BUDGET_ID_OFFSET);
            if id
                .compare_exchange(0, budget_id, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.cell(index, VALUE_OFFSET).store(0, Ordering::Relaxed);
                self.cell(index, WATCHERS_OFFSET).store(0, Ordering::Relaxed);
                self.cell(index, ATTACHMENTS_OFFSET)
                    .store(1, Ordering::Release);
                trace!(budget_id, index, "created budget");
                return Some(Budget {
                    table: self.clone(),
                    index,
                    budget_id,
                });
            }
        }

        trace!(budget_id, "budget table full");
        None
    }

    /// Attach to an existing budget, without creating it.
    pub fn find(&self, budget_id: i64) -> Option<Budget> {
        let index = self.lookup(budget_id)?;
        self.join(index, budget_id).then(|| Budget {
            table: self.clone(),
            index,
            budget_id,
        })
    }

    /// Current value of `budget_id`, read without attaching.
    pub fn value(&self, budget_id: i64) -> Option<i64> {
        let index = self.lookup(budget_id)?;
        Some(self.cell(index, VALUE_OFFSET).load(Ordering::Acquire))
    }

    /// Credit `budget_id`, creating it on first reference. Returns the new
    /// value, or `None` if the table is full.
    ///
    /// An entry created here keeps one attachment held by the table until
    /// [`detach`](Self::detach), so it outlives the call.
    pub fn credit(&self, budget_id: i64, amount: i64) -> Option<i64> {
        if let Some(budget) = self.find(budget_id) {
            return Some(budget.credit(amount));
        }
        let budget = self.attach(budget_id)?;
        let value = budget.credit(amount);
        std::mem::forget(budget);
        Some(value)
    }

    /// Drop the attachment a keyed [`credit`](Self::credit) took when it
    /// created `budget_id`. Returns false if no such budget is attached.
    pub fn detach(&self, budget_id: i64) -> bool {
        let Some(index) = self.lookup(budget_id) else {
            return false;
        };
        self.release(index, budget_id);
        true
    }

    /// Remove one attachment from the entry at `index`, clearing it when the
    /// last one goes.
    fn release(&self, index: usize, budget_id: i64) {
        let previous = self
            .cell(index, ATTACHMENTS_OFFSET)
            .fetch_sub(1, Ordering::AcqRel);
        if previous == 1 {
            self.cell(index, VALUE_OFFSET).store(0, Ordering::Relaxed);
            self.cell(index, WATCHERS_OFFSET).store(0, Ordering::Relaxed);
            self.cell(index, BUDGET_ID_OFFSET).store(0, Ordering::Release);
            trace!(budget_id, index, "removed budget");
        }
    }

    /// Debit an existing budget by at most `amount`. Returns the granted
    /// amount, zero if no such budget is attached.
    pub fn debit(&self, budget_id: i64, amount: i64) -> i64 {
        self.find(budget_id)
            .map_or(0, |budget| budget.debit(amount))
    }

    /// Number of live entries.
    pub fn attached(&self) -> usize {
        (0..self.entries)
            .filter(|&index| self.cell(index, ATTACHMENTS_OFFSET).load(Ordering::Acquire) > 0)
            .count()
    }
}

impl std::fmt::Debug for BudgetTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetTable")
            .field("entries", &self.entries)
            .field("floor", &self.floor)
            .finish()
    }
}

/// An attachment to one budget entry.
///
/// Cloning adds an attachment; the entry is freed when the last attachment
/// drops.
pub struct Budget {
    table: BudgetTable,
    index: usize,
    budget_id: i64,
}

impl Budget {
    #[inline]
    pub fn id(&self) -> i64 {
        self.budget_id
    }

    /// Position of the entry in the table.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    fn cell(&self, field: usize) -> &AtomicI64 {
        self.table.cell(self.index, field)
    }

    /// Current value, read with acquire ordering.
    pub fn value(&self) -> i64 {
        self.cell(VALUE_OFFSET).load(Ordering::Acquire)
    }

    /// Increase the budget by `amount`, saturating at `i64::MAX`. Returns
    /// the new value.
    ///
    /// # Panics
    ///
    /// If `amount` is negative.
    pub fn credit(&self, amount: i64) -> i64 {
        assert!(amount >= 0, "credit amount must be >= 0, got {amount}");
        let value = self.cell(VALUE_OFFSET);
        let mut current = value.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(amount);
            match value.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    trace!(budget_id = self.budget_id, amount, previous = current, "credited budget");
                    return next;
                }
                Err(actual) => {
                    current = actual;
                    spin_loop();
                }
            }
        }
    }

    /// Decrease the budget by at most `amount` without going below the
    /// table's floor. Returns what was granted.
    pub fn debit(&self, amount: i64) -> i64 {
        self.claim(0, amount)
    }

    /// Take `maximum` if available, otherwise everything available if that
    /// is at least `minimum`, otherwise nothing. Returns what was granted.
    ///
    /// # Panics
    ///
    /// If `minimum < 0` or `minimum > maximum`.
    pub fn claim(&self, minimum: i64, maximum: i64) -> i64 {
        assert!(
            0 <= minimum && minimum <= maximum,
            "invalid claim range {minimum}..={maximum}"
        );

        let value = self.cell(VALUE_OFFSET);
        let floor = self.table.floor;
        let mut current = value.load(Ordering::Acquire);
        loop {
            let granted = grant(current - floor, minimum, maximum);
            if granted == 0 {
                trace!(budget_id = self.budget_id, minimum, maximum, current, "claim denied");
                return 0;
            }
            match value.compare_exchange_weak(
                current,
                current - granted,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    trace!(
                        budget_id = self.budget_id,
                        granted, maximum, previous = current, "claimed budget"
                    );
                    return granted;
                }
                Err(actual) => {
                    current = actual;
                    spin_loop();
                }
            }
        }
    }

    /// Bitmask of watchers waiting for this budget to be credited.
    pub fn watchers(&self) -> u64 {
        self.cell(WATCHERS_OFFSET).load(Ordering::Acquire) as u64
    }

    /// Set `watcher`'s bit.
    ///
    /// # Panics
    ///
    /// If `watcher >= 64`.
    pub fn watch(&self, watcher: u32) {
        assert!(watcher < MAX_WATCHERS, "watcher index {watcher} out of range");
        self.cell(WATCHERS_OFFSET)
            .fetch_or(1 << watcher, Ordering::AcqRel);
    }

    /// Clear `watcher`'s bit.
    pub fn unwatch(&self, watcher: u32) {
        assert!(watcher < MAX_WATCHERS, "watcher index {watcher} out of range");
        self.cell(WATCHERS_OFFSET)
            .fetch_and(!(1 << watcher), Ordering::AcqRel);
    }
}

impl Clone for Budget {
    fn clone(&self) -> Self {
        let attachments = self.cell(ATTACHMENTS_OFFSET);
        let previous = attachments.fetch_add(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "cloned a detached budget");
        Self {
            table: self.table.clone(),
            index: self.index,
            budget_id: self.budget_id,
        }
    }
}

impl Drop for Budget {
    fn drop(&mut self) {
        self.table.release(self.index, self.budget_id);
    }
}

impl std::fmt::Debug for Budget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Budget")
            .field("id", &self.budget_id)
            .field("index", &self.index)
            .field("value", &self.value())
            .finish()
    }
}

type Flusher = Box<dyn FnMut(i64) + Send>;

struct Debited {
    budget: Budget,
    flushers: HashMap<i64, Flusher>,
    waiting: HashSet<i64>,
}

/// One worker's view of the budgets it debits.
///
/// Each stream on the worker registers a flusher under its watcher id. A
/// claim that falls short marks the stream as waiting and sets the worker's
/// watcher bit; [`flush`](Self::flush) wakes the waiting streams after the
/// budget is credited.
pub struct BudgetDebitor {
    table: BudgetTable,
    watcher: u32,
    debited: HashMap<i64, Debited>,
}

impl BudgetDebitor {
    /// # Panics
    ///
    /// If `watcher >= 64`.
    pub fn new(table: BudgetTable, watcher: u32) -> Self {
        assert!(watcher < MAX_WATCHERS, "watcher index {watcher} out of range");
        Self {
            table,
            watcher,
            debited: HashMap::new(),
        }
    }

    /// Register `watcher_id` against an existing budget. Returns false if the
    /// budget does not exist.
    pub fn acquire<F>(&mut self, budget_id: i64, watcher_id: i64, flusher: F) -> bool
    where
        F: FnMut(i64) + Send + 'static,
    {
        let debited = match self.debited.entry(budget_id) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let Some(budget) = self.table.find(budget_id) else {
                    return false;
                };
                entry.insert(Debited {
                    budget,
                    flushers: HashMap::new(),
                    waiting: HashSet::new(),
                })
            }
        };
        debited.flushers.insert(watcher_id, Box::new(flusher));
        trace!(budget_id, watcher_id, "debitor acquired");
        true
    }

    /// Claim between `minimum` and `maximum` for `watcher_id`.
    ///
    /// A short claim leaves the watcher waiting for a flush; a full claim
    /// stops it waiting.
    pub fn claim(
        &mut self,
        trace_id: i64,
        budget_id: i64,
        watcher_id: i64,
        minimum: i64,
        maximum: i64,
    ) -> i64 {
        let Some(debited) = self.debited.get_mut(&budget_id) else {
            return 0;
        };
        let claimed = debited.budget.claim(minimum, maximum);
        trace!(trace_id, budget_id, watcher_id, claimed, maximum, "debitor claim");

        if claimed != maximum {
            debited.waiting.insert(watcher_id);
            debited.budget.watch(self.watcher);
        } else if debited.waiting.remove(&watcher_id) && debited.waiting.is_empty() {
            debited.budget.unwatch(self.watcher);
        }
        claimed
    }

    /// Unregister `watcher_id`. The budget is detached once no watcher on
    /// this worker uses it.
    pub fn release(&mut self, budget_id: i64, watcher_id: i64) {
        let Some(debited) = self.debited.get_mut(&budget_id) else {
            return;
        };
        debited.flushers.remove(&watcher_id);
        if debited.waiting.remove(&watcher_id) && debited.waiting.is_empty() {
            debited.budget.unwatch(self.watcher);
        }
        if debited.flushers.is_empty() {
            self.debited.remove(&budget_id);
        }
        trace!(budget_id, watcher_id, "debitor released");
    }

    /// Invoke the flusher of every watcher waiting on `budget_id`.
    pub fn flush(&mut self, trace_id: i64, budget_id: i64) {
        let Some(debited) = self.debited.get_mut(&budget_id) else {
            return;
        };
        trace!(trace_id, budget_id, waiting = debited.waiting.len(), "flush");
        for watcher_id in &debited.waiting {
            if let Some(flusher) = debited.flushers.get_mut(watcher_id) {
                flusher(trace_id);
            }
        }
    }

    /// Value of `budget_id` if this worker is attached to it.
    pub fn available(&self, budget_id: i64) -> Option<i64> {
        self.debited.get(&budget_id).map(|d| d.budget.value())
    }

    /// Number of budgets this worker is attached to.
    pub fn acquired(&self) -> usize {
        self.debited.len()
    }

    #[inline]
    pub fn watcher(&self) -> u32 {
        self.watcher
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn make_table(entries: usize) -> BudgetTable {
        BudgetTable::build(entries, SharedRegion::heap(region_length(entries))).unwrap()
    }

    #[test]
    fn build_validates_shape() {
        assert!(matches!(
            BudgetTable::build(6, SharedRegion::heap(region_length(6))),
            Err(LayoutError::NotPowerOfTwo { .. })
        ));
        assert!(matches!(
            BudgetTable::build(8, SharedRegion::heap(100)),
            Err(LayoutError::LengthMismatch { .. })
        ));
        assert!(make_table(0).attach(1).is_none());
    }

    #[test]
    fn credit_then_debit_is_capped() {
        let table = make_table(8);
        let budget = table.attach(0x11).unwrap();

        assert_eq!(budget.credit(100), 100);
        assert_eq!(budget.debit(30), 30);
        assert_eq!(budget.debit(100), 70);
        assert_eq!(budget.value(), 0);
        assert_eq!(budget.debit(1), 0);
    }

    #[test]
    fn floor_is_respected() {
        let table = make_table(8).with_floor(10);
        let budget = table.attach(7).unwrap();
        budget.credit(25);
        assert_eq!(budget.debit(100), 15);
        assert_eq!(budget.value(), 10);
    }

    #[test]
    fn claim_minimum_and_maximum() {
        let table = make_table(8);
        let budget = table.attach(3).unwrap();
        budget.credit(50);

        assert_eq!(budget.claim(10, 40), 40);
        assert_eq!(budget.claim(20, 40), 0);
        assert_eq!(budget.value(), 10);
        assert_eq!(budget.claim(5, 40), 10);
        assert_eq!(budget.value(), 0);
    }

    #[test]
    fn both_sides_share_one_entry() {
        let table = make_table(16);
        let creditor = table.attach(42).unwrap();
        let debitor = table.clone().find(42).unwrap();
        assert_eq!(creditor.index(), debitor.index());

        creditor.credit(8);
        assert_eq!(table.value(42), Some(8));
        assert_eq!(debitor.debit(5), 5);
        assert_eq!(creditor.value(), 3);
    }

    #[test]
    fn entry_removed_when_both_sides_detach() {
        let table = make_table(4);
        let creditor = table.attach(9).unwrap();
        let debitor = creditor.clone();
        creditor.credit(10);
        assert_eq!(table.attached(), 1);

        drop(creditor);
        assert_eq!(table.value(9), Some(10));
        drop(debitor);
        assert_eq!(table.value(9), None);
        assert_eq!(table.attached(), 0);

        // A fresh reference starts from zero.
        assert_eq!(table.attach(9).unwrap().value(), 0);
    }

    #[test]
    fn keyed_operations() {
        let table = make_table(8);
        assert_eq!(table.debit(5, 10), 0);
        assert_eq!(table.value(5), None);

        let _owner = table.attach(5).unwrap();
        assert_eq!(table.credit(5, 10), Some(10));
        assert_eq!(table.debit(5, 4), 4);
        assert_eq!(table.value(5), Some(6));
        assert_eq!(table.attached(), 1);
    }

    #[test]
    fn keyed_credit_creates_budget() {
        let table = make_table(8);
        assert_eq!(table.credit(12, 10), Some(10));
        assert_eq!(table.value(12), Some(10));
        assert_eq!(table.attached(), 1);

        let debitor = table.find(12).unwrap();
        assert_eq!(debitor.value(), 10);
        assert_eq!(table.credit(12, 5), Some(15));
        drop(debitor);
        assert_eq!(table.value(12), Some(15));

        assert!(table.detach(12));
        assert_eq!(table.value(12), None);
        assert!(!table.detach(12));

        let full = make_table(1);
        let _held = full.attach(1).unwrap();
        assert_eq!(full.credit(2, 10), None);
    }

    #[test]
    fn credit_saturates() {
        let table = make_table(8);
        let budget = table.attach(4).unwrap();
        assert_eq!(budget.credit(i64::MAX - 5), i64::MAX - 5);
        assert_eq!(budget.credit(100), i64::MAX);
        assert_eq!(budget.value(), i64::MAX);
        assert_eq!(budget.debit(10), 10);
        assert_eq!(budget.value(), i64::MAX - 10);
    }

    #[test]
    fn full_table_rejects_new_budgets() {
        let table = make_table(2);
        let _a = table.attach(1).unwrap();
        let _b = table.attach(2).unwrap();
        assert!(table.attach(3).is_none());
        assert!(table.attach(1).is_some());
    }

    #[test]
    fn watchers_bitmask() {
        let table = make_table(8);
        let budget = table.attach(1).unwrap();
        budget.watch(0);
        budget.watch(5);
        assert_eq!(budget.watchers(), 0b100001);
        budget.unwatch(0);
        assert_eq!(budget.watchers(), 0b100000);
    }

    #[test]
    fn debitor_watches_until_claim_is_satisfied() {
        let table = make_table(8);
        let creditor = table.attach(77).unwrap();
        let mut debitor = BudgetDebitor::new(table.clone(), 3);

        let flushed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&flushed);
        assert!(debitor.acquire(77, 1001, move |_trace_id| {
            counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }));
        assert!(!debitor.acquire(78, 1001, |_| {}));

        assert_eq!(debitor.claim(0, 77, 1001, 0, 64), 0);
        assert_eq!(creditor.watchers(), 1 << 3);

        creditor.credit(100);
        debitor.flush(0, 77);
        assert_eq!(flushed.load(std::sync::atomic::Ordering::Relaxed), 1);

        assert_eq!(debitor.claim(0, 77, 1001, 0, 64), 64);
        assert_eq!(creditor.watchers(), 0);
        debitor.flush(0, 77);
        assert_eq!(flushed.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert_eq!(debitor.available(77), Some(36));

        debitor.release(77, 1001);
        assert_eq!(debitor.acquired(), 0);
        drop(creditor);
        assert_eq!(table.attached(), 0);
    }

    #[test]
    fn concurrent_debits_never_overdraw() {
        let table = make_table(8);
        let budget = table.attach(1).unwrap();
        budget.credit(10_000);

        let granted: i64 = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let budget = budget.clone();
                    scope.spawn(move || (0..5_000).map(|_| budget.debit(1)).sum::<i64>())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(granted, 10_000);
        assert_eq!(budget.value(), 0);
    }
}
