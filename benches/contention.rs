use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_postgres::{Client, Config, NoTls};
use ulid::Ulid;

const HOUR: i64 = 3_600_000;
/// 2030-01-01T00:00:00Z.
const T0: i64 = 1_893_456_000_000;

#[derive(Clone)]
struct Target {
    host: String,
    port: u16,
    password: String,
}

async fn connect(target: &Target, db: &str) -> Client {
    let mut config = Config::new();
    config
        .host(&target.host)
        .port(target.port)
        .dbname(db)
        .user("bench")
        .password(&target.password);

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

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
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

/// A category with `units` assets. Returns the category id.
async fn stock(client: &Client, units: usize) -> Ulid {
    let cat = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO categories (id, name, asset_type) VALUES ('{cat}', 'Laptop', 'IT')"
        ))
        .await
        .unwrap();
    for i in 0..units {
        let id = Ulid::new();
        client
            .batch_execute(&format!(
                "INSERT INTO assets (id, category_id, code) VALUES ('{id}', '{cat}', 'LAP-{i:04}')"
            ))
            .await
            .unwrap();
    }
    cat
}

async fn submit(client: &Client, cat: Ulid, qty: u32, start: i64, end: i64) -> Ulid {
    let rid = Ulid::new();
    client
        .batch_execute(&format!(
            r#"INSERT INTO requests (id, requester_id, categories, start, "end", initial_status)
               VALUES ('{rid}', '{}', '[{{"categoryId": "{cat}", "quantity": {qty}}}]', {start}, {end}, 'PENDING_AM')"#,
            Ulid::new()
        ))
        .await
        .unwrap();
    rid
}

async fn approve(client: &Client, rid: Ulid) -> Result<(), tokio_postgres::Error> {
    client
        .batch_execute(&format!(
            "INSERT INTO request_status (request_id, status) VALUES ('{rid}', 'AM_APPROVED')"
        ))
        .await
}

/// Disjoint windows, one approval at a time.
async fn phase1_sequential(target: &Target) {
    let client = connect(target, &format!("bench_{}", Ulid::new())).await;
    let cat = stock(&client, 10).await;

    let n = 1000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n {
        let s = T0 + (i as i64) * HOUR;
        let rid = submit(&client, cat, 2, s, s + HOUR).await;
        let t = Instant::now();
        approve(&client, rid).await.unwrap();
        latencies.push(t.elapsed());
    }
    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} approvals in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("approval latency", &mut latencies);
}

/// Many connections race to approve overlapping requests against a small
/// pool. Exactly `units / qty` approvals can win; the rest must fail cleanly.
async fn phase2_contention(target: &Target) {
    let db = format!("bench_{}", Ulid::new());
    let units = 8;
    let qty = 2;
    let n_tasks = 32;

    let setup = connect(target, &db).await;
    let cat = stock(&setup, units).await;
    let mut requests = Vec::with_capacity(n_tasks);
    for _ in 0..n_tasks {
        requests.push(submit(&setup, cat, qty, T0, T0 + 8 * HOUR).await);
    }

    let won = Arc::new(AtomicUsize::new(0));
    let lost = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();
    for rid in requests {
        let target = target.clone();
        let db = db.clone();
        let (won, lost) = (won.clone(), lost.clone());
        handles.push(tokio::spawn(async move {
            let client = connect(&target, &db).await;
            let t = Instant::now();
            match approve(&client, rid).await {
                Ok(()) => {
                    won.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    let code = e.as_db_error().map(|d| d.code().code().to_string());
                    match code.as_deref() {
                        Some("23514") | Some("40001") => {
                            lost.fetch_add(1, Ordering::Relaxed);
                        }
                        other => eprintln!("unexpected error {other:?}: {e}"),
                    }
                }
            }
            t.elapsed()
        }));
    }

    let mut latencies = Vec::with_capacity(handles.len());
    for h in handles {
        if let Ok(d) = h.await {
            latencies.push(d);
        }
    }
    let elapsed = start.elapsed();
    let won = won.load(Ordering::Relaxed);
    let lost = lost.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} racers for {units} units (qty {qty}): {won} approved, {lost} refused in {:.2}s",
        elapsed.as_secs_f64()
    );
    let expected = units / qty as usize;
    if won != expected {
        println!("  !! expected exactly {expected} approvals, got {won}");
    }
    print_latency("approval latency under contention", &mut latencies);

    let ledger = setup
        .simple_query("SELECT * FROM borrowed_assets")
        .await
        .unwrap()
        .into_iter()
        .filter(|m| matches!(m, tokio_postgres::SimpleQueryMessage::Row(_)))
        .count();
    println!("  ledger rows: {ledger} (expected {units})");
}

/// Availability reads while a writer keeps approving.
async fn phase3_reads_under_load(target: &Target) {
    let db = format!("bench_{}", Ulid::new());
    let client = connect(target, &db).await;
    let cat = stock(&client, 20).await;

    let writer_target = target.clone();
    let writer_db = db.clone();
    let writer = tokio::spawn(async move {
        let client = connect(&writer_target, &writer_db).await;
        for i in 0..500 {
            let s = T0 + (i as i64) * HOUR;
            let rid = submit(&client, cat, 1, s, s + HOUR).await;
            let _ = approve(&client, rid).await;
        }
    });

    let n = 500;
    let mut latencies = Vec::with_capacity(n);
    for i in 0..n {
        let s = T0 + (i as i64 % 100) * HOUR;
        let t = Instant::now();
        client
            .simple_query(&format!(
                r#"SELECT * FROM category_availability WHERE category_id = '{cat}' AND start >= {s} AND "end" <= {} AND quantity = 5"#,
                s + 4 * HOUR
            ))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }
    let _ = writer.await;
    print_latency("availability latency", &mut latencies);
}

async fn phase4_connection_storm(target: &Target) {
    let n_conns = 100;
    let ok = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_conns {
        let target = target.clone();
        let ok = ok.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&target, &format!("bench_{}", Ulid::new())).await;
            let cat = stock(&client, 2).await;
            let rid = submit(&client, cat, 1, T0, T0 + HOUR).await;
            if approve(&client, rid).await.is_ok() {
                ok.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }
    for h in handles {
        let _ = h.await;
    }
    let ok = ok.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections: {ok}/{n_conns} succeeded in {:.2}s",
        start.elapsed().as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let target = Target {
        host: std::env::var("QM_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
        port: std::env::var("QM_PORT")
            .unwrap_or_else(|_| "5433".into())
            .parse()
            .expect("invalid QM_PORT"),
        password: std::env::var("QM_PASSWORD").unwrap_or_else(|_| "quartermaster".into()),
    };

    println!("=== quartermaster contention benchmark ===");
    println!("target: {}:{}\n", target.host, target.port);

    println!("[phase 1] sequential approvals");
    phase1_sequential(&target).await;

    println!("\n[phase 2] approvals racing for a small pool");
    phase2_contention(&target).await;

    println!("\n[phase 3] availability reads under write load");
    phase3_reads_under_load(&target).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&target).await;

    println!("\n=== benchmark complete ===");
}
