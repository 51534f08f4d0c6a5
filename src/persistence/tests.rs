use super::DeferredLedger;
use tempfile::tempdir;

#[test]
fn test_record_and_list_in_sequence_order() {
    let ledger = DeferredLedger::temporary().unwrap();

    ledger.record("orders", 12, "m-12").unwrap();
    ledger.record("orders", 3, "m-3").unwrap();
    ledger.record("orders", 7, "m-7").unwrap();

    let records = ledger.list("orders").unwrap();
    let numbers: Vec<i64> = records.iter().map(|r| r.sequence_number).collect();
    assert_eq!(numbers, vec![3, 7, 12]);
    assert_eq!(records[0].message_id, "m-3");
}

#[test]
fn test_queues_are_isolated() {
    let ledger = DeferredLedger::temporary().unwrap();

    ledger.record("orders", 1, "a").unwrap();
    ledger.record("invoices", 2, "b").unwrap();

    assert_eq!(ledger.sequence_numbers("orders").unwrap(), vec![1]);
    assert_eq!(ledger.sequence_numbers("invoices").unwrap(), vec![2]);
    assert!(ledger.list("payments").unwrap().is_empty());
}

#[test]
fn test_remove_reports_whether_recorded() {
    let ledger = DeferredLedger::temporary().unwrap();
    ledger.record("orders", 5, "m-5").unwrap();

    assert!(ledger.remove("orders", 5).unwrap());
    assert!(!ledger.remove("orders", 5).unwrap());
    assert!(ledger.list("orders").unwrap().is_empty());
}

#[test]
fn test_open_on_disk_and_share_between_clones() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ledger");
    let ledger = DeferredLedger::open(path.to_str().unwrap()).unwrap();
    let clone = ledger.clone();

    ledger.record("orders", 42, "m-42").unwrap();
    ledger.flush().unwrap();

    assert_eq!(clone.sequence_numbers("orders").unwrap(), vec![42]);
}

#[test]
fn test_clear_forgets_every_queue() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ledger");
    let ledger = DeferredLedger::open(path.to_str().unwrap()).unwrap();

    ledger.record("orders", 1, "a").unwrap();
    ledger.record("orders", 2, "b").unwrap();
    ledger.record("invoices", 1, "c").unwrap();

    assert_eq!(ledger.clear().unwrap(), 3);
    assert!(ledger.list("orders").unwrap().is_empty());
    assert!(ledger.list("invoices").unwrap().is_empty());
    assert_eq!(ledger.clear().unwrap(), 0);

    ledger.record("orders", 1, "fresh").unwrap();
    assert_eq!(ledger.sequence_numbers("orders").unwrap(), vec![1]);
}
