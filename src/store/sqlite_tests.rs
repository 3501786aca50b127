use super::*;
use crate::consolidate::{Loser, MergePlan};
use crate::store::GroupKey;
use chrono::TimeZone;

fn test_store() -> SqliteStore {
    SqliteStore::open(":memory:").expect("in-memory store")
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn rec(id: &str, provider: &str, prompt: &str, uses: &str, secs: i64) -> ResultRecord {
    ResultRecord {
        id: id.into(),
        provider: provider.into(),
        prompt: prompt.into(),
        uses: uses.into(),
        created_at: at(secs),
    }
}

#[test]
fn select_filters_and_orders_by_creation() {
    let s = test_store();
    s.import(&[
        rec("c", "chatgpt", "x", "1", 30),
        rec("a", "chatgpt", "x", "2", 10),
        rec("b", "chatgpt", "y", "3", 20),
        rec("d", "other", "x", "4", 5),
    ])
    .unwrap();

    let all = s.select_sync(&RecordFilter::provider("chatgpt"), None).unwrap();
    let ids: Vec<_> = all.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, ["a", "b", "c"]);

    let key = GroupKey { provider: "chatgpt".into(), prompt: "x".into() };
    let group = s.select_sync(&RecordFilter::key(&key), None).unwrap();
    assert_eq!(group.len(), 2);
    assert_eq!(group[0].created_at, at(10));
}

#[test]
fn range_is_a_hard_cap() {
    let s = test_store();
    let rows: Vec<_> = (0..10)
        .map(|i| rec(&format!("r{i}"), "chatgpt", &format!("p{i}"), "1", i))
        .collect();
    s.import(&rows).unwrap();

    let page = s
        .select_sync(&RecordFilter::provider("chatgpt"), Some(BatchRange::new(3, 4)))
        .unwrap();
    let ids: Vec<_> = page.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, ["r3", "r4", "r5", "r6"]);

    let tail = s
        .select_sync(&RecordFilter::provider("chatgpt"), Some(BatchRange::inclusive(8, 20)))
        .unwrap();
    assert_eq!(tail.len(), 2);
}

#[test]
fn uses_text_is_preserved() {
    let s = test_store();
    s.import(&[rec("a", "chatgpt", "x", "abc", 0)]).unwrap();
    let got = s.get("a").unwrap().unwrap();
    assert_eq!(got.uses, "abc");
    assert!(got.parse_uses().is_err());
}

#[test]
fn delete_missing_row_reports_false() {
    let s = test_store();
    s.import(&[rec("a", "chatgpt", "x", "1", 0)]).unwrap();
    assert!(s.delete_sync("a").unwrap());
    assert!(!s.delete_sync("a").unwrap());
}

#[test]
fn update_missing_row_is_not_found() {
    let s = test_store();
    let err = s.update_sync("ghost", &RecordPatch::uses(3)).unwrap_err();
    assert!(matches!(err, TallyError::NotFound));
    // empty patch is a no-op even for unknown ids
    s.update_sync("ghost", &RecordPatch::default()).unwrap();
}

fn plan(winner: &str, losers: &[&str], total: i64) -> MergePlan {
    MergePlan {
        key: GroupKey { provider: "chatgpt".into(), prompt: "x".into() },
        winner_id: winner.into(),
        winner_uses: 0,
        losers: losers.iter().map(|id| Loser { id: (*id).into(), uses: 0 }).collect(),
        total_uses: total,
    }
}

#[test]
fn merge_applies_in_one_transaction() {
    let s = test_store();
    s.import(&[
        rec("a", "chatgpt", "x", "2", 1),
        rec("b", "chatgpt", "x", "3", 2),
        rec("c", "chatgpt", "x", "1", 3),
    ])
    .unwrap();

    s.merge_sync(&plan("a", &["b", "c"], 6)).unwrap();
    assert_eq!(s.get("a").unwrap().unwrap().uses, "6");
    assert!(s.get("b").unwrap().is_none());
    assert!(s.get("c").unwrap().is_none());
}

#[test]
fn merge_rolls_back_when_a_loser_vanished() {
    let s = test_store();
    s.import(&[rec("a", "chatgpt", "x", "2", 1), rec("b", "chatgpt", "x", "3", 2)]).unwrap();

    let err = s.merge_sync(&plan("a", &["b", "gone"], 6)).unwrap_err();
    assert!(matches!(err, TallyError::StaleGroup(_)));
    // b must still be there, a untouched
    assert!(s.get("b").unwrap().is_some());
    assert_eq!(s.get("a").unwrap().unwrap().uses, "2");
}

#[test]
fn lease_excludes_other_holders_until_expiry() {
    let s = test_store();
    let ttl = Duration::from_secs(60);
    assert!(s.acquire_lease_sync("job", "one", ttl).unwrap());
    assert!(!s.acquire_lease_sync("job", "two", ttl).unwrap());
    // re-entrant for the same holder
    assert!(s.acquire_lease_sync("job", "one", ttl).unwrap());

    s.release_lease_sync("job", "two").unwrap();
    assert!(!s.acquire_lease_sync("job", "two", ttl).unwrap());

    s.release_lease_sync("job", "one").unwrap();
    assert!(s.acquire_lease_sync("job", "two", ttl).unwrap());
}

#[test]
fn expired_lease_can_be_taken_over() {
    let s = test_store();
    assert!(s.acquire_lease_sync("job", "one", Duration::ZERO).unwrap());
    assert!(s.acquire_lease_sync("job", "two", Duration::from_secs(60)).unwrap());
}
