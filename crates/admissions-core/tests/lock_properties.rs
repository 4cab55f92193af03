use admissions_core::clock::{Clock, ManualClock, SystemClock};
use admissions_core::error::SyncError;
use admissions_core::lock::{LockManager, LockToken};
use admissions_core::remote::{DirRemote, RemoteFs};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

const LOCK: &str = "/srv/escuela/escuela.db.lock";
const HOLDERS: [&str; 3] = ["A", "B", "C"];

/// Random claim/release/advance runs: the remote never shows two live
/// tokens, and contention is reported exactly while another holder's token
/// is unexpired.
#[tokio::test]
async fn random_schedules_keep_a_single_live_holder() {
    for seed in 0..8u64 {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let remote: Arc<dyn RemoteFs> = Arc::new(DirRemote::new(dir.path()));
        let locks = LockManager::new(remote, clock.clone(), LOCK);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut held: HashMap<&str, LockToken> = HashMap::new();
        let ttl = Duration::from_secs(5);

        for _ in 0..60 {
            let holder = HOLDERS[rng.gen_range(0..HOLDERS.len())];
            match rng.gen_range(0..3) {
                0 => {
                    let now = clock.now();
                    let live_other = held
                        .values()
                        .find(|t| t.holder != holder && !t.is_expired_at(now))
                        .cloned();
                    match locks.acquire(holder, ttl).await {
                        Ok(token) => {
                            assert!(live_other.is_none(), "seed {seed}: claimed over {live_other:?}");
                            held.retain(|_, t| t.token_id == token.token_id);
                            held.insert(holder, token);
                        }
                        Err(SyncError::LockContention { holder: owner, .. }) => {
                            let other = live_other.unwrap_or_else(|| {
                                panic!("seed {seed}: contention reported with no live holder")
                            });
                            assert_eq!(owner, other.holder);
                        }
                        Err(e) => panic!("seed {seed}: {e}"),
                    }
                }
                1 => {
                    if let Some(token) = held.remove(holder) {
                        locks.release(&token).await.unwrap();
                    }
                }
                _ => clock.advance(chrono::Duration::seconds(rng.gen_range(1..4))),
            }

            let current = locks.current().await.unwrap();
            let live = locks.live().await.unwrap();
            if let Some(live) = &live {
                assert_eq!(Some(live), current.as_ref());
                assert_eq!(held.get(live.holder.as_str()), Some(live));
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_have_one_winner() {
    let dir = tempdir().unwrap();
    let remote: Arc<dyn RemoteFs> = Arc::new(DirRemote::new(dir.path()));
    let locks = Arc::new(LockManager::new(remote, Arc::new(SystemClock), LOCK));

    let mut tasks = Vec::new();
    for i in 0..8 {
        let locks = locks.clone();
        tasks.push(tokio::spawn(async move {
            locks.acquire(&format!("staff{i}"), Duration::from_secs(30)).await
        }));
    }

    let mut winners = Vec::new();
    for task in tasks {
        match task.await.unwrap() {
            Ok(token) => winners.push(token),
            Err(e) => assert!(e.is_lock_contention(), "unexpected error {e}"),
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(locks.current().await.unwrap().as_ref(), winners.first());
}
