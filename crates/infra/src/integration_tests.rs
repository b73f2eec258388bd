//! End-to-end tests for issuance through the service and the in-memory store.
//!
//! Tests: IssueRequest → StockService → transaction → lots + ledger
//!
//! Verifies:
//! - FIFO split and exact totals
//! - Failed requests leave lots and ledger untouched
//! - A store failure mid-walk rolls back every partial write
//! - Concurrent issuances never over-issue
//! - Transactions on different items never conflict
//! - Conflicts beyond the retry budget surface as retryable failures

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};

    use chrono::Utc;

    use lotkeeper_core::{LotId, UserId};
    use lotkeeper_inventory::{
        IssueRecord, IssueRequest, ItemKey, MinimumStock, MovementRecord, StockError, StockLot,
    };

    use crate::config::ServiceConfig;
    use crate::service::StockService;
    use crate::store::{
        InMemoryStockStore, InMemoryTransaction, LotStore, MovementLedger, StockTransaction, StoreError,
        TransactionSource,
    };

    fn seed(store: &InMemoryStockStore, item: &str, qty: i64, order: u64) -> LotId {
        let lot_id = LotId::new();
        let lot = StockLot::received(lot_id, ItemKey::parse(item).unwrap(), qty, order, Utc::now()).unwrap();
        store.seed_lot(lot).unwrap();
        lot_id
    }

    /// Bolt lots `{1: qty 3, order 1}`, `{2: qty 5, order 2}`.
    fn bolt_fixture() -> (StockService<InMemoryStockStore>, LotId, LotId) {
        lotkeeper_observability::init();
        let store = InMemoryStockStore::new();
        let first = seed(&store, "bolt", 3, 1);
        let second = seed(&store, "bolt", 5, 2);
        (StockService::new(store, ServiceConfig::default()), first, second)
    }

    fn quantity(service: &StockService<InMemoryStockStore>, lot_id: LotId) -> i64 {
        service.store().lot(lot_id).unwrap().unwrap().quantity_on_hand()
    }

    #[test]
    fn issue_four_bolts_splits_three_and_one() {
        let (service, first, second) = bolt_fixture();

        let result = service
            .issue(&IssueRequest::new("bolt", 4, UserId::new(), None))
            .unwrap();

        let breakdown: Vec<_> = result.allocations.iter().map(|a| (a.lot_id, a.quantity)).collect();
        assert_eq!(breakdown, vec![(first, 3), (second, 1)]);
        assert_eq!(quantity(&service, first), 0);
        assert_eq!(quantity(&service, second), 4);

        let magnitudes: Vec<_> = result.movements.iter().map(|m| m.quantity_delta).collect();
        assert_eq!(magnitudes, vec![3, 1]);
        assert_eq!(service.store().movement_count().unwrap(), 2);
        assert_eq!(result.request.quantity, 4);
    }

    #[test]
    fn issue_ten_bolts_is_insufficient_and_changes_nothing() {
        let (service, first, second) = bolt_fixture();

        let err = service
            .issue(&IssueRequest::new("bolt", 10, UserId::new(), None))
            .unwrap_err();

        assert_eq!(
            err,
            StockError::InsufficientStock {
                item_key: "bolt".into(),
                requested: 10,
                available: 8,
            }
        );
        assert_eq!(quantity(&service, first), 3);
        assert_eq!(quantity(&service, second), 5);
        assert_eq!(service.store().movement_count().unwrap(), 0);
        assert!(service.issued_items().unwrap().is_empty());
    }

    #[test]
    fn invalid_quantities_fail_identically_without_side_effects() {
        let (service, first, second) = bolt_fixture();
        let actor = UserId::new();

        for qty in [0, -1] {
            let request = IssueRequest::new("bolt", qty, actor, None);
            let once = service.issue(&request).unwrap_err();
            let twice = service.issue(&request).unwrap_err();
            assert!(matches!(once, StockError::InvalidRequest(_)));
            assert_eq!(once, twice);
        }
        assert_eq!(quantity(&service, first), 3);
        assert_eq!(quantity(&service, second), 5);
        assert_eq!(service.store().movement_count().unwrap(), 0);
    }

    #[test]
    fn item_without_lots_is_not_found() {
        let (service, _, _) = bolt_fixture();
        let err = service
            .issue(&IssueRequest::new("washer", 1, UserId::new(), None))
            .unwrap_err();
        assert_eq!(err, StockError::ItemNotFound { item_key: "washer".into() });
        assert!(!err.is_retryable());
    }

    #[test]
    fn issue_leaves_other_items_alone() {
        let (service, _, _) = bolt_fixture();
        let nut = seed(service.store(), "nut", 7, 0);
        service
            .issue(&IssueRequest::new("bolt", 8, UserId::new(), None))
            .unwrap();
        assert_eq!(quantity(&service, nut), 7);
        assert_eq!(service.available_quantity("bolt").unwrap(), 0);
    }

    /// Store wrapper that injects faults into its transactions.
    ///
    /// `fail_on_write` (1-based, 0 = never) fails the n-th write of every
    /// transaction. `rival_deductions` makes that many `list_available_lots`
    /// calls commit a competing one-unit deduction on the oldest lot right
    /// after the read, so the reading transaction holds a stale version.
    #[derive(Debug, Clone)]
    struct FlakyStore {
        inner: InMemoryStockStore,
        fail_on_write: usize,
        rival_deductions: Arc<AtomicUsize>,
    }

    impl FlakyStore {
        fn failing_on_write(inner: InMemoryStockStore, fail_on_write: usize) -> Self {
            Self {
                inner,
                fail_on_write,
                rival_deductions: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn with_rival_deductions(inner: InMemoryStockStore, times: usize) -> Self {
            Self {
                inner,
                fail_on_write: 0,
                rival_deductions: Arc::new(AtomicUsize::new(times)),
            }
        }
    }

    #[derive(Debug)]
    struct FlakyTransaction {
        inner: InMemoryTransaction,
        source: InMemoryStockStore,
        writes: usize,
        fail_on_write: usize,
        rival_deductions: Arc<AtomicUsize>,
    }

    impl FlakyTransaction {
        fn write(&mut self) -> Result<(), StoreError> {
            self.writes += 1;
            if self.writes == self.fail_on_write {
                return Err(StoreError::Backend("connection reset".to_string()));
            }
            Ok(())
        }

        fn race(&self, lots: &[StockLot]) -> Result<(), StoreError> {
            let Some(oldest) = lots.first() else {
                return Ok(());
            };
            if self
                .rival_deductions
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err()
            {
                return Ok(());
            }
            let mut rival = self.source.begin()?;
            rival.apply_deduction(oldest.lot_id(), 1)?;
            rival.commit()
        }
    }

    impl TransactionSource for FlakyStore {
        type Tx = FlakyTransaction;

        fn begin(&self) -> Result<Self::Tx, StoreError> {
            Ok(FlakyTransaction {
                inner: self.inner.begin()?,
                source: self.inner.clone(),
                writes: 0,
                fail_on_write: self.fail_on_write,
                rival_deductions: Arc::clone(&self.rival_deductions),
            })
        }
    }

    impl LotStore for FlakyTransaction {
        fn list_available_lots(&mut self, item_key: &ItemKey) -> Result<Vec<StockLot>, StoreError> {
            let lots = self.inner.list_available_lots(item_key)?;
            self.race(&lots)?;
            Ok(lots)
        }

        fn has_lots(&mut self, item_key: &ItemKey) -> Result<bool, StoreError> {
            self.inner.has_lots(item_key)
        }

        fn lots_for_item(&mut self, item_key: &ItemKey) -> Result<Vec<StockLot>, StoreError> {
            self.inner.lots_for_item(item_key)
        }

        fn get_lot(&mut self, lot_id: LotId) -> Result<Option<StockLot>, StoreError> {
            self.inner.get_lot(lot_id)
        }

        fn apply_deduction(&mut self, lot_id: LotId, amount: i64) -> Result<(), StoreError> {
            self.write()?;
            self.inner.apply_deduction(lot_id, amount)
        }

        fn save_lot(&mut self, lot: StockLot) -> Result<(), StoreError> {
            self.write()?;
            self.inner.save_lot(lot)
        }

        fn next_received_order(&mut self) -> Result<u64, StoreError> {
            self.inner.next_received_order()
        }

        fn all_lots(&mut self) -> Result<Vec<StockLot>, StoreError> {
            self.inner.all_lots()
        }

        fn minimum_stocks(&mut self) -> Result<Vec<MinimumStock>, StoreError> {
            self.inner.minimum_stocks()
        }

        fn set_minimum_stock(&mut self, threshold: MinimumStock) -> Result<(), StoreError> {
            self.write()?;
            self.inner.set_minimum_stock(threshold)
        }
    }

    impl MovementLedger for FlakyTransaction {
        fn append(&mut self, movement: MovementRecord) -> Result<(), StoreError> {
            self.write()?;
            self.inner.append(movement)
        }

        fn record_issue(&mut self, record: IssueRecord) -> Result<(), StoreError> {
            self.write()?;
            self.inner.record_issue(record)
        }

        fn movements_for_lot(&mut self, lot_id: LotId) -> Result<Vec<MovementRecord>, StoreError> {
            self.inner.movements_for_lot(lot_id)
        }

        fn issue_records(&mut self) -> Result<Vec<IssueRecord>, StoreError> {
            self.inner.issue_records()
        }
    }

    impl StockTransaction for FlakyTransaction {
        fn commit(self) -> Result<(), StoreError> {
            self.inner.commit()
        }

        fn rollback(self) -> Result<(), StoreError> {
            self.inner.rollback()
        }
    }

    #[test]
    fn failure_mid_walk_rolls_back_every_partial_write() {
        let store = InMemoryStockStore::new();
        let first = seed(&store, "bolt", 3, 1);
        let second = seed(&store, "bolt", 5, 2);

        // Writes: deduct lot 1, append, deduct lot 2 (fails).
        let service = StockService::new(
            FlakyStore::failing_on_write(store.clone(), 3),
            ServiceConfig::default(),
        );

        let err = service
            .issue(&IssueRequest::new("bolt", 4, UserId::new(), None))
            .unwrap_err();

        assert!(matches!(err, StockError::PersistenceFailure(ref msg) if msg.contains("connection reset")));
        assert!(err.is_retryable());
        assert_eq!(store.lot(first).unwrap().unwrap().quantity_on_hand(), 3);
        assert_eq!(store.lot(second).unwrap().unwrap().quantity_on_hand(), 5);
        assert_eq!(store.movement_count().unwrap(), 0);

        // Retrying against a healthy store succeeds from the untouched state.
        let healthy = StockService::new(store.clone(), ServiceConfig::default());
        let result = healthy
            .issue(&IssueRequest::new("bolt", 4, UserId::new(), None))
            .unwrap();
        assert_eq!(result.total_issued(), 4);
        assert_eq!(store.movement_count().unwrap(), 2);
    }

    #[test]
    fn failing_issue_record_write_rolls_back_deductions() {
        let store = InMemoryStockStore::new();
        let lot = seed(&store, "bolt", 3, 1);
        // Writes: deduct, append, record_issue (fails).
        let service = StockService::new(
            FlakyStore::failing_on_write(store.clone(), 3),
            ServiceConfig::default(),
        );

        assert!(service.issue(&IssueRequest::new("bolt", 2, UserId::new(), None)).is_err());
        assert_eq!(store.lot(lot).unwrap().unwrap().quantity_on_hand(), 3);
        assert_eq!(store.movement_count().unwrap(), 0);
    }

    #[test]
    fn open_transaction_on_one_item_survives_a_commit_on_another() {
        let store = InMemoryStockStore::new();
        let bolt = seed(&store, "bolt", 3, 1);
        let nut = seed(&store, "nut", 4, 2);
        let service = StockService::new(store.clone(), ServiceConfig::default());

        let mut bolt_tx = store.begin().unwrap();
        let lots = bolt_tx.list_available_lots(&ItemKey::parse("bolt").unwrap()).unwrap();
        assert_eq!(lots.len(), 1);
        bolt_tx.apply_deduction(bolt, 2).unwrap();

        service.issue(&IssueRequest::new("nut", 2, UserId::new(), None)).unwrap();

        bolt_tx.commit().unwrap();
        assert_eq!(store.lot(bolt).unwrap().unwrap().quantity_on_hand(), 1);
        assert_eq!(store.lot(nut).unwrap().unwrap().quantity_on_hand(), 2);
    }

    #[test]
    fn stale_read_without_retry_budget_is_a_retryable_failure() {
        let store = InMemoryStockStore::new();
        let first = seed(&store, "bolt", 3, 1);
        let second = seed(&store, "bolt", 5, 2);
        let service = StockService::new(
            FlakyStore::with_rival_deductions(store.clone(), 1),
            ServiceConfig {
                max_conflict_retries: 0,
                ..ServiceConfig::default()
            },
        );

        let err = service
            .issue(&IssueRequest::new("bolt", 4, UserId::new(), None))
            .unwrap_err();

        assert!(matches!(err, StockError::PersistenceFailure(ref msg) if msg.contains("concurrent modification")));
        assert!(err.is_retryable());
        // Only the rival's deduction landed.
        assert_eq!(store.lot(first).unwrap().unwrap().quantity_on_hand(), 2);
        assert_eq!(store.lot(second).unwrap().unwrap().quantity_on_hand(), 5);
        assert_eq!(store.movement_count().unwrap(), 0);
        assert!(store.begin().unwrap().issue_records().unwrap().is_empty());
    }

    #[test]
    fn stale_read_within_retry_budget_reruns_from_fresh_state() {
        let store = InMemoryStockStore::new();
        let first = seed(&store, "bolt", 3, 1);
        let second = seed(&store, "bolt", 5, 2);
        let service = StockService::new(
            FlakyStore::with_rival_deductions(store.clone(), 1),
            ServiceConfig::default(),
        );

        let result = service
            .issue(&IssueRequest::new("bolt", 4, UserId::new(), None))
            .unwrap();

        let split: Vec<_> = result.allocations.iter().map(|a| (a.lot_id, a.quantity)).collect();
        assert_eq!(split, vec![(first, 2), (second, 2)]);
        assert_eq!(store.lot(first).unwrap().unwrap().quantity_on_hand(), 0);
        assert_eq!(store.lot(second).unwrap().unwrap().quantity_on_hand(), 3);
    }

    #[test]
    fn concurrent_issues_cannot_both_succeed_past_availability() {
        let (service, first, second) = bolt_fixture();
        let service = Arc::new(service);
        let barrier = Arc::new(Barrier::new(2));

        let outcomes: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let service = Arc::clone(&service);
                    let barrier = Arc::clone(&barrier);
                    scope.spawn(move || {
                        barrier.wait();
                        service.issue(&IssueRequest::new("bolt", 6, UserId::new(), None))
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let successes = outcomes.iter().filter(|o| o.is_ok()).count();
        assert_eq!(successes, 1);
        assert!(outcomes.iter().any(|o| matches!(o, Err(StockError::InsufficientStock { .. }))));
        assert_eq!(quantity(&service, first) + quantity(&service, second), 2);
    }

    #[test]
    fn many_threads_never_over_issue() {
        let (service, first, second) = bolt_fixture();
        let service = Arc::new(service);
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));

        let outcomes: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    let service = Arc::clone(&service);
                    let barrier = Arc::clone(&barrier);
                    scope.spawn(move || {
                        barrier.wait();
                        service.issue(&IssueRequest::new("bolt", 3, UserId::new(), None))
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let issued: i64 = outcomes
            .iter()
            .filter_map(|o| o.as_ref().ok())
            .map(|r| r.total_issued())
            .sum();
        let remaining = quantity(&service, first) + quantity(&service, second);

        assert_eq!(issued, 6);
        assert_eq!(remaining, 2);
        assert_eq!(service.issued_items().unwrap().len(), 2);
        for outcome in &outcomes {
            if let Err(err) = outcome {
                assert!(matches!(err, StockError::InsufficientStock { .. }), "unexpected {err}");
            }
        }
    }
}
