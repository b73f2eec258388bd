use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use lotkeeper_core::{ExpectedVersion, LotId, Versioned};
use lotkeeper_inventory::{IssueRecord, ItemKey, MinimumStock, MovementRecord, StockLot};

use super::{LotStore, MovementLedger, StockTransaction, StoreError, TransactionSource};

#[derive(Debug, Default)]
struct Committed {
    lots: HashMap<LotId, StockLot>,
    movements: Vec<MovementRecord>,
    issues: Vec<IssueRecord>,
    minimums: BTreeMap<ItemKey, i64>,
}

#[derive(Debug, Default)]
struct Shared {
    committed: RwLock<Committed>,
    next_order: AtomicU64,
}

impl Shared {
    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Committed>, StoreError> {
        self.committed
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Committed>, StoreError> {
        self.committed
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))
    }
}

/// In-memory lot store and ledger with optimistic concurrency.
///
/// Intended for tests/dev. Cloning yields another handle to the same data.
/// Transactions stage their writes privately and keep a snapshot of every
/// committed lot they read, so repeated reads agree; `commit` fails with
/// `StoreError::Conflict` if any of those lots changed in the meantime.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStockStore {
    shared: Arc<Shared>,
}

impl InMemoryStockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an already-built lot directly (fixtures, imports).
    pub fn seed_lot(&self, lot: StockLot) -> Result<(), StoreError> {
        let mut committed = self.shared.write()?;
        self.shared
            .next_order
            .fetch_max(lot.received_order().saturating_add(1), Ordering::SeqCst);
        committed.lots.insert(lot.lot_id(), lot);
        Ok(())
    }

    /// Committed state of one lot, outside any transaction.
    pub fn lot(&self, lot_id: LotId) -> Result<Option<StockLot>, StoreError> {
        Ok(self.shared.read()?.lots.get(&lot_id).cloned())
    }

    /// Number of committed movement records.
    pub fn movement_count(&self) -> Result<usize, StoreError> {
        Ok(self.shared.read()?.movements.len())
    }
}

impl TransactionSource for InMemoryStockStore {
    type Tx = InMemoryTransaction;

    fn begin(&self) -> Result<Self::Tx, StoreError> {
        Ok(InMemoryTransaction {
            shared: Arc::clone(&self.shared),
            observed: HashMap::new(),
            staged_lots: HashMap::new(),
            movements: Vec::new(),
            issues: Vec::new(),
            minimums: BTreeMap::new(),
            finished: false,
        })
    }
}

/// Unit of work over an `InMemoryStockStore`.
#[derive(Debug)]
pub struct InMemoryTransaction {
    shared: Arc<Shared>,
    /// Each committed lot as it was at first read.
    observed: HashMap<LotId, StockLot>,
    staged_lots: HashMap<LotId, StockLot>,
    movements: Vec<MovementRecord>,
    issues: Vec<IssueRecord>,
    /// Thresholds set in this transaction; last write per item wins at commit.
    minimums: BTreeMap<ItemKey, i64>,
    finished: bool,
}

impl InMemoryTransaction {
    /// The transaction's view of a committed lot: staged write, else the
    /// snapshot taken at first read.
    fn observe(&mut self, lot: StockLot) -> StockLot {
        if let Some(staged) = self.staged_lots.get(&lot.lot_id()) {
            return staged.clone();
        }
        self.observed.entry(lot.lot_id()).or_insert(lot).clone()
    }

    /// Committed lots of `item_key` overlaid with this transaction's writes.
    fn item_view(&mut self, item_key: &ItemKey) -> Result<Vec<StockLot>, StoreError> {
        let committed: Vec<StockLot> = self
            .shared
            .read()?
            .lots
            .values()
            .filter(|l| l.item_key() == item_key)
            .cloned()
            .collect();

        let mut view = Vec::with_capacity(committed.len());
        for lot in committed {
            view.push(self.observe(lot));
        }
        view.extend(
            self.staged_lots
                .values()
                .filter(|l| l.item_key() == item_key && !self.observed.contains_key(&l.lot_id()))
                .cloned(),
        );
        view.sort_by_key(StockLot::fifo_key);
        Ok(view)
    }

    fn has_writes(&self) -> bool {
        !self.staged_lots.is_empty()
            || !self.movements.is_empty()
            || !self.issues.is_empty()
            || !self.minimums.is_empty()
    }
}

impl LotStore for InMemoryTransaction {
    fn list_available_lots(&mut self, item_key: &ItemKey) -> Result<Vec<StockLot>, StoreError> {
        let mut lots = self.item_view(item_key)?;
        lots.retain(|l| l.quantity_on_hand() > 0);
        Ok(lots)
    }

    fn has_lots(&mut self, item_key: &ItemKey) -> Result<bool, StoreError> {
        Ok(!self.item_view(item_key)?.is_empty())
    }

    fn lots_for_item(&mut self, item_key: &ItemKey) -> Result<Vec<StockLot>, StoreError> {
        self.item_view(item_key)
    }

    fn get_lot(&mut self, lot_id: LotId) -> Result<Option<StockLot>, StoreError> {
        if let Some(staged) = self.staged_lots.get(&lot_id) {
            return Ok(Some(staged.clone()));
        }
        if let Some(seen) = self.observed.get(&lot_id) {
            return Ok(Some(seen.clone()));
        }
        let lot = self.shared.read()?.lots.get(&lot_id).cloned();
        Ok(lot.map(|lot| self.observe(lot)))
    }

    fn apply_deduction(&mut self, lot_id: LotId, amount: i64) -> Result<(), StoreError> {
        let mut lot = self.get_lot(lot_id)?.ok_or(StoreError::LotNotFound(lot_id))?;
        lot.deduct(amount)?;
        self.staged_lots.insert(lot_id, lot);
        Ok(())
    }

    fn save_lot(&mut self, lot: StockLot) -> Result<(), StoreError> {
        self.staged_lots.insert(lot.lot_id(), lot);
        Ok(())
    }

    fn next_received_order(&mut self) -> Result<u64, StoreError> {
        Ok(self.shared.next_order.fetch_add(1, Ordering::SeqCst))
    }

    fn all_lots(&mut self) -> Result<Vec<StockLot>, StoreError> {
        let mut lots: HashMap<LotId, StockLot> = self.shared.read()?.lots.clone();
        lots.extend(self.staged_lots.iter().map(|(id, lot)| (*id, lot.clone())));
        let mut lots: Vec<StockLot> = lots.into_values().collect();
        lots.sort_by(|a, b| a.item_key().cmp(b.item_key()).then(a.fifo_key().cmp(&b.fifo_key())));
        Ok(lots)
    }

    fn minimum_stocks(&mut self) -> Result<Vec<MinimumStock>, StoreError> {
        let mut minimums = self.shared.read()?.minimums.clone();
        minimums.extend(self.minimums.iter().map(|(k, v)| (k.clone(), *v)));
        minimums
            .into_iter()
            .map(|(item_key, minimum)| MinimumStock::new(item_key, minimum).map_err(StoreError::from))
            .collect()
    }

    fn set_minimum_stock(&mut self, threshold: MinimumStock) -> Result<(), StoreError> {
        self.minimums.insert(threshold.item_key, threshold.minimum);
        Ok(())
    }
}

impl MovementLedger for InMemoryTransaction {
    fn append(&mut self, movement: MovementRecord) -> Result<(), StoreError> {
        self.movements.push(movement);
        Ok(())
    }

    fn record_issue(&mut self, record: IssueRecord) -> Result<(), StoreError> {
        self.issues.push(record);
        Ok(())
    }

    fn movements_for_lot(&mut self, lot_id: LotId) -> Result<Vec<MovementRecord>, StoreError> {
        let mut movements: Vec<MovementRecord> = self
            .shared
            .read()?
            .movements
            .iter()
            .filter(|m| m.lot_id == lot_id)
            .cloned()
            .collect();
        movements.extend(self.movements.iter().filter(|m| m.lot_id == lot_id).cloned());
        Ok(movements)
    }

    fn issue_records(&mut self) -> Result<Vec<IssueRecord>, StoreError> {
        let mut records = self.shared.read()?.issues.clone();
        records.extend(self.issues.iter().cloned());
        records.sort_by(|a, b| b.issued_at.cmp(&a.issued_at));
        Ok(records)
    }
}

impl StockTransaction for InMemoryTransaction {
    fn commit(mut self) -> Result<(), StoreError> {
        let shared = Arc::clone(&self.shared);
        let mut committed = shared.write()?;

        for (lot_id, seen) in &self.observed {
            let current = committed
                .lots
                .get(lot_id)
                .ok_or_else(|| StoreError::Conflict(format!("lot {lot_id} disappeared")))?;
            ExpectedVersion(seen.version())
                .check(current.version())
                .map_err(|e| StoreError::Conflict(format!("lot {lot_id}: {e}")))?;
        }

        for (lot_id, lot) in self.staged_lots.drain() {
            committed.lots.insert(lot_id, lot);
        }
        committed.movements.append(&mut self.movements);
        committed.issues.append(&mut self.issues);
        committed.minimums.append(&mut self.minimums);

        self.finished = true;
        Ok(())
    }

    fn rollback(mut self) -> Result<(), StoreError> {
        self.finished = true;
        Ok(())
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if !self.finished && self.has_writes() {
            tracing::debug!(
                staged_lots = self.staged_lots.len(),
                staged_movements = self.movements.len(),
                "transaction dropped without commit; discarding staged writes"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lotkeeper_core::UserId;
    use lotkeeper_inventory::{Direction, REASON_ISSUED};

    fn seeded(qty: i64, order: u64) -> (InMemoryStockStore, LotId) {
        let store = InMemoryStockStore::new();
        let lot_id = LotId::new();
        let lot = StockLot::received(lot_id, ItemKey::parse("bolt").unwrap(), qty, order, Utc::now()).unwrap();
        store.seed_lot(lot).unwrap();
        (store, lot_id)
    }

    fn movement(lot_id: LotId, qty: i64) -> MovementRecord {
        MovementRecord::new(lot_id, qty, Direction::Out, REASON_ISSUED, UserId::new(), Utc::now()).unwrap()
    }

    #[test]
    fn commit_publishes_staged_writes() {
        let (store, lot_id) = seeded(5, 1);
        let mut tx = store.begin().unwrap();
        tx.apply_deduction(lot_id, 2).unwrap();
        tx.append(movement(lot_id, 2)).unwrap();
        assert_eq!(store.lot(lot_id).unwrap().unwrap().quantity_on_hand(), 5);
        tx.commit().unwrap();

        assert_eq!(store.lot(lot_id).unwrap().unwrap().quantity_on_hand(), 3);
        assert_eq!(store.movement_count().unwrap(), 1);
    }

    #[test]
    fn drop_without_commit_discards_writes() {
        let (store, lot_id) = seeded(5, 1);
        {
            let mut tx = store.begin().unwrap();
            tx.apply_deduction(lot_id, 5).unwrap();
            tx.append(movement(lot_id, 5)).unwrap();
        }
        assert_eq!(store.lot(lot_id).unwrap().unwrap().quantity_on_hand(), 5);
        assert_eq!(store.movement_count().unwrap(), 0);
    }

    #[test]
    fn stale_read_fails_commit() {
        let (store, lot_id) = seeded(5, 1);
        let mut first = store.begin().unwrap();
        let mut second = store.begin().unwrap();
        first.apply_deduction(lot_id, 4).unwrap();
        second.apply_deduction(lot_id, 4).unwrap();

        first.commit().unwrap();
        let err = second.commit().unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.lot(lot_id).unwrap().unwrap().quantity_on_hand(), 1);
    }

    #[test]
    fn reads_are_repeatable_within_a_transaction() {
        let (store, lot_id) = seeded(5, 1);
        let key = ItemKey::parse("bolt").unwrap();
        let mut reader = store.begin().unwrap();
        assert_eq!(reader.list_available_lots(&key).unwrap()[0].quantity_on_hand(), 5);

        let mut rival = store.begin().unwrap();
        rival.apply_deduction(lot_id, 2).unwrap();
        rival.commit().unwrap();

        assert_eq!(reader.get_lot(lot_id).unwrap().unwrap().quantity_on_hand(), 5);
        reader.apply_deduction(lot_id, 5).unwrap();
        assert!(reader.commit().unwrap_err().is_conflict());
        assert_eq!(store.lot(lot_id).unwrap().unwrap().quantity_on_hand(), 3);
    }

    #[test]
    fn deduction_beyond_on_hand_is_an_invariant_error() {
        let (store, lot_id) = seeded(1, 1);
        let mut tx = store.begin().unwrap();
        assert!(matches!(tx.apply_deduction(lot_id, 2), Err(StoreError::Invariant(_))));
        assert!(matches!(tx.apply_deduction(LotId::new(), 1), Err(StoreError::LotNotFound(_))));
    }

    #[test]
    fn staged_lots_are_visible_inside_the_transaction() {
        let (store, _) = seeded(0, 1);
        let key = ItemKey::parse("bolt").unwrap();
        let mut tx = store.begin().unwrap();
        assert!(tx.has_lots(&key).unwrap());
        assert!(tx.list_available_lots(&key).unwrap().is_empty());

        let order = tx.next_received_order().unwrap();
        assert_eq!(order, 2);
        let fresh = StockLot::received(LotId::new(), key.clone(), 4, order, Utc::now()).unwrap();
        tx.save_lot(fresh.clone()).unwrap();
        assert_eq!(tx.list_available_lots(&key).unwrap(), vec![fresh]);
    }

    #[test]
    fn thresholds_publish_on_commit_only() {
        let (store, _) = seeded(3, 1);
        let key = ItemKey::parse("bolt").unwrap();
        let mut tx = store.begin().unwrap();
        tx.set_minimum_stock(MinimumStock::new(key.clone(), 5).unwrap()).unwrap();
        assert_eq!(tx.minimum_stocks().unwrap().len(), 1);
        assert!(store.begin().unwrap().minimum_stocks().unwrap().is_empty());

        tx.commit().unwrap();
        let mut reader = store.begin().unwrap();
        assert_eq!(reader.minimum_stocks().unwrap(), vec![MinimumStock::new(key, 5).unwrap()]);
        assert_eq!(reader.all_lots().unwrap().len(), 1);
    }

    #[test]
    fn poisoned_lock_surfaces_as_backend_error() {
        let (store, lot_id) = seeded(3, 1);
        let shared = Arc::clone(&store.shared);
        let _ = std::thread::spawn(move || {
            let _guard = shared.committed.write().unwrap();
            panic!("writer died holding the lock");
        })
        .join();

        assert!(matches!(store.lot(lot_id), Err(StoreError::Backend(_))));
        assert!(matches!(store.movement_count(), Err(StoreError::Backend(_))));
    }
}
