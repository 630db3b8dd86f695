//! # Client Benchmark Harness
//!
//! Purpose: Drive a running TagCache server through the client so throughput
//! and latency of single and pipelined operations can be compared over time.
//!
//! ## Design Principles
//! 1. **Deterministic Workload**: Keys and values are built up front from a
//!    fixed seed; the hot loop only talks to the server.
//! 2. **Environment Configuration**: Connection settings come from the same
//!    `TAGCACHE_*` variables the client reads; the target argument overrides
//!    host and port (or the HTTP base URL).
//! 3. **Comparable Output**: Every phase prints ops/s plus p50 and p99.
//!
//! Usage: `tagcache-bench <host:port | http://url> [ops] [value_size] [batch]`

use std::env;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tagcache_client::{ClientConfig, TagCacheClient, TransportMode, Value};

const DEFAULT_OP_COUNT: usize = 10_000;
const DEFAULT_VALUE_SIZE: usize = 128;
const DEFAULT_BATCH: usize = 100;

struct BenchConfig {
    target: String,
    op_count: usize,
    value_size: usize,
    batch: usize,
}

impl BenchConfig {
    fn from_args() -> Result<Self> {
        let mut args = env::args().skip(1);
        let target = match args.next() {
            Some(target) => target,
            None => bail!("usage: tagcache-bench <host:port | http://url> [ops] [value_size] [batch]"),
        };
        let config = BenchConfig {
            target,
            op_count: parse_usize(args.next(), DEFAULT_OP_COUNT)?,
            value_size: parse_usize(args.next(), DEFAULT_VALUE_SIZE)?,
            batch: parse_usize(args.next(), DEFAULT_BATCH)?,
        };
        if config.op_count == 0 || config.batch == 0 {
            bail!("ops and batch must be positive");
        }
        Ok(config)
    }
}

/// Points `config` at `target`.
fn apply_target(config: &mut ClientConfig, target: &str) -> Result<()> {
    if target.starts_with("http://") || target.starts_with("https://") {
        config.mode = TransportMode::Http;
        config.http_url = target.to_string();
        return Ok(());
    }
    let (host, port) = target
        .rsplit_once(':')
        .with_context(|| format!("target {:?} is not host:port", target))?;
    config.mode = TransportMode::Tcp;
    config.host = host.trim_start_matches('[').trim_end_matches(']').to_string();
    config.port = port
        .parse()
        .with_context(|| format!("invalid port in {:?}", target))?;
    Ok(())
}

fn parse_usize(value: Option<String>, fallback: usize) -> Result<usize> {
    match value {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("invalid numeric argument {:?}", raw)),
        None => Ok(fallback),
    }
}

/// Alphanumeric payloads keep the native codec on its inline path.
fn build_values(count: usize, size: usize, seed: u64) -> Vec<String> {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            (0..size)
                .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
                .collect()
        })
        .collect()
}

struct Samples {
    label: &'static str,
    ops: usize,
    latencies: Vec<Duration>,
    elapsed: Duration,
}

impl Samples {
    fn percentile(&mut self, pct: f64) -> Duration {
        if self.latencies.is_empty() {
            return Duration::ZERO;
        }
        self.latencies.sort_unstable();
        let rank = ((self.latencies.len() - 1) as f64 * pct).round() as usize;
        self.latencies[rank]
    }

    fn report(mut self) {
        let secs = self.elapsed.as_secs_f64().max(f64::EPSILON);
        let ops_per_sec = self.ops as f64 / secs;
        let p50 = self.percentile(0.50);
        let p99 = self.percentile(0.99);
        println!(
            "{}: {} ops in {:.3}s ({:.0} ops/s, p50 {:?}, p99 {:?})",
            self.label, self.ops, secs, ops_per_sec, p50, p99
        );
    }
}

fn timed<F>(label: &'static str, ops: usize, calls: usize, mut call: F) -> Result<Samples>
where
    F: FnMut(usize) -> Result<()>,
{
    let mut latencies = Vec::with_capacity(calls);
    let start = Instant::now();
    for idx in 0..calls {
        let begin = Instant::now();
        call(idx)?;
        latencies.push(begin.elapsed());
    }
    Ok(Samples {
        label,
        ops,
        latencies,
        elapsed: start.elapsed(),
    })
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    if let Err(err) = run() {
        eprintln!("tagcache-bench failed: {:#}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let bench = BenchConfig::from_args()?;
    let mut config = ClientConfig::from_env().context("reading TAGCACHE_* settings")?;
    apply_target(&mut config, &bench.target)?;
    let addr = bench.target.clone();
    let client = TagCacheClient::new(config).context("building client")?;

    let keys: Vec<String> = (0..bench.op_count).map(|i| format!("bench:{}", i)).collect();
    let values = build_values(bench.op_count, bench.value_size, 0x5A5A_5A5A_5A5A_5A5A);
    info!(addr = %addr, ops = bench.op_count, value_size = bench.value_size, batch = bench.batch, "starting");
    println!(
        "target={} transport={} serializer={} ops={} value_size={} batch={}",
        addr,
        client.transport_name(),
        client.serializer_kind(),
        bench.op_count,
        bench.value_size,
        bench.batch
    );

    timed("put", bench.op_count, bench.op_count, |i| {
        client.put(&keys[i], values[i].as_str(), &["bench"], None)?;
        Ok(())
    })?
    .report();

    timed("get", bench.op_count, bench.op_count, |i| {
        client.get(&keys[i])?;
        Ok(())
    })?
    .report();

    let batches: Vec<&[String]> = keys.chunks(bench.batch).collect();
    timed("bulk_put", bench.op_count, batches.len(), |b| {
        let start = b * bench.batch;
        let items = batches[b]
            .iter()
            .zip(&values[start..])
            .map(|(k, v)| (k.as_str(), Value::from(v.as_str())));
        client.bulk_put(items, None)?;
        Ok(())
    })?
    .report();

    timed("bulk_get", bench.op_count, batches.len(), |b| {
        let refs: Vec<&str> = batches[b].iter().map(String::as_str).collect();
        let found = client.bulk_get(&refs)?;
        if found.len() != refs.len() {
            bail!("bulk_get returned {} of {} keys", found.len(), refs.len());
        }
        Ok(())
    })?
    .report();

    let mut removed = 0;
    for batch in &batches {
        let refs: Vec<&str> = batch.iter().map(String::as_str).collect();
        removed += client.bulk_delete(&refs)?;
    }
    let stats = client.stats()?;
    println!(
        "cleanup: deleted {} keys; server hits={} misses={} hit_ratio={:.3}",
        removed, stats.hits, stats.misses, stats.hit_ratio
    );
    client.close();
    Ok(())
}
