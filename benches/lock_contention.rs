//! Lock contention benchmark: many users racing for the same few spaces.
//!
//! Runs in-process against a `Store` by default. Pass `--tcp HOST:PORT` to
//! drive a running server over the wire instead.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use ulid::Ulid;

use deskhold::api::BookingStore;
use deskhold::client::RemoteStore;
use deskhold::model::*;
use deskhold::notify::NotifyHub;
use deskhold::protocol::Request;
use deskhold::store::Store;

const USERS: usize = 64;
const ATTEMPTS_PER_USER: usize = 200;

const OPEN_ALL_WEEK: &str = r#"{"recurring": {
    "monday":    {"enabled": true, "slots": [{"start": "07:00", "end": "22:00"}]},
    "tuesday":   {"enabled": true, "slots": [{"start": "07:00", "end": "22:00"}]},
    "wednesday": {"enabled": true, "slots": [{"start": "07:00", "end": "22:00"}]},
    "thursday":  {"enabled": true, "slots": [{"start": "07:00", "end": "22:00"}]},
    "friday":    {"enabled": true, "slots": [{"start": "07:00", "end": "22:00"}]},
    "saturday":  {"enabled": true, "slots": [{"start": "07:00", "end": "22:00"}]},
    "sunday":    {"enabled": true, "slots": [{"start": "07:00", "end": "22:00"}]}
}}"#;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.3}ms, p50={:.3}ms, p95={:.3}ms, p99={:.3}ms, max={:.3}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

#[derive(Default)]
struct Tally {
    granted: Vec<Duration>,
    rejected: Vec<Duration>,
    errors: usize,
}

/// Capacities of the contended spaces: a few exclusive desks and some
/// shared rooms.
const CAPACITIES: [u32; 8] = [1, 1, 1, 1, 4, 4, 10, 10];

async fn setup_local(store: &Store) -> Vec<SpaceId> {
    let mut ids = Vec::new();
    for capacity in CAPACITIES {
        let id = Ulid::new();
        let settings = SpaceSettings {
            capacity,
            ..Default::default()
        };
        store
            .register_space(id, None, settings, OPEN_ALL_WEEK.into())
            .await
            .expect("register");
        ids.push(id);
    }
    ids
}

async fn setup_remote(client: &RemoteStore) -> Vec<SpaceId> {
    let mut ids = Vec::new();
    for capacity in CAPACITIES {
        let id = Ulid::new();
        let req = Request::RegisterSpace {
            id,
            name: None,
            settings: SpaceSettings {
                capacity,
                ..Default::default()
            },
            availability: serde_json::Value::String(OPEN_ALL_WEEK.into()),
        };
        client.call(&req).await.expect("register");
        ids.push(id);
    }
    ids
}

/// Every user hammers random hour windows on random spaces and releases
/// whatever it gets, so the windows keep turning over.
async fn run(backend: Arc<dyn BookingStore>, spaces: Arc<Vec<SpaceId>>) -> Tally {
    let date = Utc::now().date_naive() + chrono::Days::new(3);
    let mut handles = Vec::with_capacity(USERS);

    for user in 0..USERS {
        let backend = backend.clone();
        let spaces = spaces.clone();
        handles.push(tokio::spawn(async move {
            let mut tally = Tally::default();
            for attempt in 0..ATTEMPTS_PER_USER {
                let space_id = spaces[(user * 7 + attempt) % spaces.len()];
                let hour = 8 + ((user + attempt * 3) % 12) as u16;
                let req = LockRequest {
                    space_id,
                    date,
                    start_time: Clock::at(hour, 0),
                    end_time: Clock::at(hour + 1, 0),
                    token: Ulid::new(),
                    user_id: format!("user-{user}"),
                    seats: 1,
                    ttl_ms: None,
                };
                let token = req.token;
                let started = Instant::now();
                match backend.acquire_reservation_lock(req).await {
                    Ok(result) if result.valid => {
                        tally.granted.push(started.elapsed());
                        let _ = backend.release_hold(token).await;
                    }
                    Ok(_) => tally.rejected.push(started.elapsed()),
                    Err(e) => {
                        tally.errors += 1;
                        if tally.errors == 1 {
                            eprintln!("user {user}: {e}");
                        }
                    }
                }
            }
            tally
        }));
    }

    let mut total = Tally::default();
    for handle in handles {
        let tally = handle.await.expect("worker panicked");
        total.granted.extend(tally.granted);
        total.rejected.extend(tally.rejected);
        total.errors += tally.errors;
    }
    total
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let tcp = args
        .iter()
        .position(|a| a == "--tcp")
        .and_then(|i| args.get(i + 1).cloned());

    let (backend, spaces): (Arc<dyn BookingStore>, Vec<SpaceId>) = match tcp {
        Some(addr) => {
            println!("deskhold lock contention (tcp {addr})");
            let client = Arc::new(RemoteStore::new(addr, Duration::from_secs(5)));
            let spaces = setup_remote(&client).await;
            let client: Arc<dyn BookingStore> = client;
            (client, spaces)
        }
        None => {
            println!("deskhold lock contention (in-process)");
            let dir = std::env::temp_dir().join(format!("deskhold_bench_{}", Ulid::new()));
            std::fs::create_dir_all(&dir).expect("bench dir");
            let store = Store::open(&dir.join("bench.wal"), Arc::new(NotifyHub::new()), 15 * 60_000)
                .expect("open store");
            let spaces = setup_local(&store).await;
            let store: Arc<dyn BookingStore> = Arc::new(store);
            (store, spaces)
        }
    };
    println!("  {} spaces, {USERS} users x {ATTEMPTS_PER_USER} attempts", spaces.len());

    let started = Instant::now();
    let mut tally = run(backend, Arc::new(spaces)).await;
    let elapsed = started.elapsed();

    let attempts = tally.granted.len() + tally.rejected.len() + tally.errors;
    println!(
        "  {attempts} attempts in {:.2}s ({:.0} locks/s), {} errors",
        elapsed.as_secs_f64(),
        attempts as f64 / elapsed.as_secs_f64(),
        tally.errors,
    );
    print_latency("granted", &mut tally.granted);
    print_latency("rejected", &mut tally.rejected);
}
