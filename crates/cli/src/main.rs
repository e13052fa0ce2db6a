//! `strata`: an interactive shell over a key-value or spatial store.
//!
//! ```text
//! strata <dir> [--hr]
//! ```
//!
//! Commands are read line by line from stdin; `help` lists them.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use engine::{Config, HrDb, KvDb, Rect};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

const HELP: &str = "\
commands:
  add <key> <value>                 (kv)
  add <x0> <y0> <x1> <y1> <value>   (hr)
  get <key>                         (kv)
  at <rank>                         (kv)
  scan [from]                       (kv)
  search <x0> <y0> <x1> <y1>        (hr)
  flush | compact | stats | help | quit";

enum Store {
    Kv(KvDb),
    Hr(HrDb),
}

impl Store {
    fn close(self) -> Result<()> {
        match self {
            Store::Kv(db) => db.close()?,
            Store::Hr(db) => db.close()?,
        }
        Ok(())
    }
}

struct Args {
    dir: PathBuf,
    spatial: bool,
}

fn parse_args(args: impl Iterator<Item = String>) -> Result<Args> {
    let mut dir = None;
    let mut spatial = false;
    for arg in args {
        match arg.as_str() {
            "--hr" => spatial = true,
            "--kv" => spatial = false,
            flag if flag.starts_with("--") => bail!("unknown flag {flag}"),
            _ if dir.is_none() => dir = Some(PathBuf::from(arg)),
            _ => bail!("unexpected argument {arg}"),
        }
    }
    let dir = dir.ok_or_else(|| anyhow!("usage: strata <dir> [--hr]"))?;
    Ok(Args { dir, spatial })
}

fn parse_rect(parts: &[&str]) -> Result<Rect> {
    let [x0, y0, x1, y1] = parts else {
        bail!("expected four coordinates");
    };
    let coord = |s: &str| s.parse::<u32>().with_context(|| format!("bad coordinate {s:?}"));
    Ok(Rect::new(coord(*x0)?, coord(*y0)?, coord(*x1)?, coord(*y1)?))
}

/// Runs one command line. Returns `false` when the shell should exit.
fn execute(store: &Store, line: &str, out: &mut impl Write) -> Result<bool> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some((&cmd, rest)) = parts.split_first() else {
        return Ok(true);
    };

    match (cmd, store) {
        ("quit" | "exit", _) => return Ok(false),
        ("help", _) => writeln!(out, "{HELP}")?,

        ("add", Store::Kv(db)) => {
            let [key, value] = rest else {
                bail!("usage: add <key> <value>");
            };
            db.add(key.as_bytes(), value.as_bytes())?;
            writeln!(out, "ok")?;
        }
        ("add", Store::Hr(db)) => {
            let Some((value, coords)) = rest.split_last() else {
                bail!("usage: add <x0> <y0> <x1> <y1> <value>");
            };
            db.add(parse_rect(coords)?, value.as_bytes())?;
            writeln!(out, "ok")?;
        }
        ("get", Store::Kv(db)) => {
            let [key] = rest else {
                bail!("usage: get <key>");
            };
            match db.get(key.as_bytes())? {
                Some(value) => writeln!(out, "{}", String::from_utf8_lossy(&value))?,
                None => writeln!(out, "(not found)")?,
            }
        }
        ("at", Store::Kv(db)) => {
            let [rank] = rest else {
                bail!("usage: at <rank>");
            };
            let rank: u64 = rank.parse().context("rank must be a number")?;
            let (key, value) = db.at(rank)?;
            writeln!(
                out,
                "{} = {}",
                String::from_utf8_lossy(&key),
                String::from_utf8_lossy(&value)
            )?;
        }
        ("scan", Store::Kv(db)) => {
            let mut cursor = match rest {
                [] => db.begin()?,
                [from] => db.seek_key(from.as_bytes())?,
                _ => bail!("usage: scan [from]"),
            };
            while cursor.has_next() {
                writeln!(
                    out,
                    "{} = {}",
                    String::from_utf8_lossy(cursor.key()?),
                    String::from_utf8_lossy(cursor.value()?)
                )?;
                cursor.next()?;
            }
        }
        ("search", Store::Hr(db)) => {
            let values = db.search(&parse_rect(rest)?)?;
            for value in &values {
                writeln!(out, "{}", String::from_utf8_lossy(value))?;
            }
            writeln!(out, "({} found)", values.len())?;
        }

        ("flush", Store::Kv(db)) => db.flush()?,
        ("flush", Store::Hr(db)) => db.flush()?,
        ("compact", Store::Kv(db)) => db.compact()?,
        ("compact", Store::Hr(db)) => db.compact()?,
        ("stats", Store::Kv(db)) => {
            let stats = db.cache_stats();
            writeln!(out, "entries:  {}", db.len())?;
            writeln!(out, "buffered: {} ({} bytes)", db.buffered(), db.buffered_bytes())?;
            writeln!(out, "segments: {} {:?}", db.segment_count(), db.level_shape())?;
            writeln!(out, "cache:    {} hits / {} misses", stats.hits, stats.misses)?;
        }
        ("stats", Store::Hr(db)) => {
            let stats = db.cache_stats();
            writeln!(out, "entries:  {}", db.len())?;
            writeln!(out, "buffered: {} ({} bytes)", db.buffered(), db.buffered_bytes())?;
            writeln!(out, "segments: {} {:?}", db.segment_count(), db.level_shape())?;
            writeln!(out, "cache:    {} hits / {} misses", stats.hits, stats.misses)?;
        }

        ("add" | "get" | "at" | "scan" | "search", _) => {
            bail!("{cmd} is not available for this store")
        }
        _ => bail!("unknown command {cmd:?}; try help"),
    }
    Ok(true)
}

fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let args = parse_args(std::env::args().skip(1))?;
    let store = if args.spatial {
        Store::Hr(HrDb::open(&args.dir, Config::default())?)
    } else {
        Store::Kv(KvDb::open(&args.dir, Config::default())?)
    };
    info!(dir = %args.dir.display(), "shell started");

    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();
    for line in stdin.lock().lines() {
        let line = line?;
        match execute(&store, &line, &mut stdout) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => writeln!(stdout, "error: {e:#}")?,
        }
        stdout.flush()?;
    }
    store.close()
}
