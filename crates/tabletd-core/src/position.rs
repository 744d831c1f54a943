//! Replication position arithmetic
//!
//! A [`Position`] is a durable marker of replication progress, tagged with
//! the flavor of the server that produced it:
//!
//! - **MySQL56**: a GTID set, `uuid:1-5:7,uuid:1-10`
//! - **MariaDB**: domain-based GTIDs, `0-1-100,1-1-5`
//! - **FilePos**: a binlog file name and byte offset, `binlog.000003:4420`
//!
//! Set operations (union, difference, subset) are exact for MySQL56 and
//! defined per-domain for MariaDB. Mixing flavors in a binary operation is
//! a caller bug and fails with a precondition error.
//!
//! Canonical encoding is `Flavor/value`, e.g.
//! `MySQL56/3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5`. The bare MySQL56
//! form is accepted on decode for backward compatibility.

use crate::error::{Result, TabletError};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Position flavor tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flavor {
    Mysql56,
    MariaDb,
    FilePos,
}

impl Flavor {
    pub fn name(&self) -> &'static str {
        match self {
            Flavor::Mysql56 => "MySQL56",
            Flavor::MariaDb => "MariaDB",
            Flavor::FilePos => "FilePos",
        }
    }
}

/// A single MySQL 5.6-style global transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Gtid {
    pub server: Uuid,
    pub sequence: u64,
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.server, self.sequence)
    }
}

/// A closed interval of transaction sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub start: u64,
    pub end: u64,
}

impl Interval {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, seq: u64) -> bool {
        self.start <= seq && seq <= self.end
    }
}

/// An unordered set of (server UUID, transaction intervals).
///
/// Intervals are kept normalized: per server they are sorted, non-empty,
/// non-overlapping and non-adjacent. All operations preserve that invariant,
/// which makes structural equality canonical equality.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GtidSet {
    intervals: BTreeMap<Uuid, Vec<Interval>>,
}

impl GtidSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Parse the canonical ASCII form, e.g. `uuid:1-5:7,uuid:1-10`.
    pub fn parse(s: &str) -> Result<Self> {
        let mut set = GtidSet::new();
        let s = s.trim();
        if s.is_empty() {
            return Ok(set);
        }
        for part in s.split(',') {
            let part = part.trim();
            let mut pieces = part.split(':');
            let sid = pieces.next().unwrap_or_default();
            let server = Uuid::parse_str(sid).map_err(|e| {
                TabletError::failed_precondition(format!("invalid GTID server id {sid:?}: {e}"))
            })?;
            let mut any = false;
            for range in pieces {
                any = true;
                let (start, end) = match range.split_once('-') {
                    Some((a, b)) => (parse_seq(a)?, parse_seq(b)?),
                    None => {
                        let n = parse_seq(range)?;
                        (n, n)
                    }
                };
                if start == 0 || end < start {
                    return Err(TabletError::failed_precondition(format!(
                        "invalid GTID interval {range:?}"
                    )));
                }
                set.add_interval(server, Interval::new(start, end));
            }
            if !any {
                return Err(TabletError::failed_precondition(format!(
                    "GTID {part:?} has no interval"
                )));
            }
        }
        Ok(set)
    }

    /// Add a single transaction id.
    pub fn add(&mut self, gtid: Gtid) {
        self.add_interval(gtid.server, Interval::new(gtid.sequence, gtid.sequence));
    }

    /// Add an interval, merging as needed.
    pub fn add_interval(&mut self, server: Uuid, iv: Interval) {
        let list = self.intervals.entry(server).or_default();
        list.push(iv);
        normalize(list);
    }

    pub fn contains(&self, gtid: &Gtid) -> bool {
        self.intervals
            .get(&gtid.server)
            .map(|ivs| ivs.iter().any(|iv| iv.contains(gtid.sequence)))
            .unwrap_or(false)
    }

    /// True if every GTID in `self` is also in `other`.
    pub fn subset_of(&self, other: &GtidSet) -> bool {
        for (server, ivs) in &self.intervals {
            let theirs = match other.intervals.get(server) {
                Some(t) => t,
                None => return false,
            };
            for iv in ivs {
                if !theirs
                    .iter()
                    .any(|t| t.start <= iv.start && iv.end <= t.end)
                {
                    return false;
                }
            }
        }
        true
    }

    pub fn union(&self, other: &GtidSet) -> GtidSet {
        let mut out = self.clone();
        for (server, ivs) in &other.intervals {
            for iv in ivs {
                out.add_interval(*server, *iv);
            }
        }
        out
    }

    /// `self \ other`.
    pub fn difference(&self, other: &GtidSet) -> GtidSet {
        let mut out = GtidSet::new();
        for (server, ivs) in &self.intervals {
            let remaining = match other.intervals.get(server) {
                None => ivs.clone(),
                Some(theirs) => subtract(ivs, theirs),
            };
            if !remaining.is_empty() {
                out.intervals.insert(*server, remaining);
            }
        }
        out
    }
}

fn parse_seq(s: &str) -> Result<u64> {
    s.trim()
        .parse::<u64>()
        .map_err(|e| TabletError::failed_precondition(format!("invalid GTID sequence {s:?}: {e}")))
}

/// Sort, merge overlapping and adjacent intervals in place.
fn normalize(list: &mut Vec<Interval>) {
    list.sort_by_key(|iv| iv.start);
    let mut merged: Vec<Interval> = Vec::with_capacity(list.len());
    for iv in list.drain(..) {
        match merged.last_mut() {
            Some(last) if iv.start <= last.end.saturating_add(1) => {
                last.end = last.end.max(iv.end);
            }
            _ => merged.push(iv),
        }
    }
    *list = merged;
}

/// `a \ b` for normalized interval lists.
fn subtract(a: &[Interval], b: &[Interval]) -> Vec<Interval> {
    let mut out = Vec::new();
    for iv in a {
        let mut pieces = vec![*iv];
        for cut in b {
            let mut next = Vec::new();
            for piece in pieces {
                if cut.end < piece.start || cut.start > piece.end {
                    next.push(piece);
                    continue;
                }
                if cut.start > piece.start {
                    next.push(Interval::new(piece.start, cut.start - 1));
                }
                if cut.end < piece.end {
                    next.push(Interval::new(cut.end + 1, piece.end));
                }
            }
            pieces = next;
        }
        out.extend(pieces);
    }
    normalize(&mut out);
    out
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (server, ivs) in &self.intervals {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{server}")?;
            for iv in ivs {
                if iv.start == iv.end {
                    write!(f, ":{}", iv.start)?;
                } else {
                    write!(f, ":{}-{}", iv.start, iv.end)?;
                }
            }
        }
        Ok(())
    }
}

/// A single MariaDB domain GTID: `domain-server-sequence`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MariadbGtid {
    pub domain: u32,
    pub server: u32,
    pub sequence: u64,
}

impl fmt::Display for MariadbGtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.domain, self.server, self.sequence)
    }
}

/// One GTID per replication domain; sequence numbers are totally ordered
/// within a domain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MariadbGtidSet {
    domains: BTreeMap<u32, MariadbGtid>,
}

impl MariadbGtidSet {
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn parse(s: &str) -> Result<Self> {
        let mut set = MariadbGtidSet::default();
        let s = s.trim();
        if s.is_empty() {
            return Ok(set);
        }
        for part in s.split(',') {
            let fields: Vec<&str> = part.trim().split('-').collect();
            if fields.len() != 3 {
                return Err(TabletError::failed_precondition(format!(
                    "invalid MariaDB GTID {part:?}"
                )));
            }
            let gtid = MariadbGtid {
                domain: fields[0].parse().map_err(|_| {
                    TabletError::failed_precondition(format!("invalid domain in {part:?}"))
                })?,
                server: fields[1].parse().map_err(|_| {
                    TabletError::failed_precondition(format!("invalid server in {part:?}"))
                })?,
                sequence: fields[2].parse().map_err(|_| {
                    TabletError::failed_precondition(format!("invalid sequence in {part:?}"))
                })?,
            };
            set.add(gtid);
        }
        Ok(set)
    }

    /// Keep the highest sequence per domain.
    pub fn add(&mut self, gtid: MariadbGtid) {
        match self.domains.get(&gtid.domain) {
            Some(existing) if existing.sequence >= gtid.sequence => {}
            _ => {
                self.domains.insert(gtid.domain, gtid);
            }
        }
    }

    pub fn subset_of(&self, other: &MariadbGtidSet) -> bool {
        self.domains.iter().all(|(domain, gtid)| {
            other
                .domains
                .get(domain)
                .map(|o| o.sequence >= gtid.sequence)
                .unwrap_or(false)
        })
    }

    pub fn union(&self, other: &MariadbGtidSet) -> MariadbGtidSet {
        let mut out = self.clone();
        for gtid in other.domains.values() {
            out.add(*gtid);
        }
        out
    }

    pub fn difference(&self, other: &MariadbGtidSet) -> MariadbGtidSet {
        let mut out = MariadbGtidSet::default();
        for (domain, gtid) in &self.domains {
            let covered = other
                .domains
                .get(domain)
                .map(|o| o.sequence >= gtid.sequence)
                .unwrap_or(false);
            if !covered {
                out.domains.insert(*domain, *gtid);
            }
        }
        out
    }
}

impl fmt::Display for MariadbGtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for gtid in self.domains.values() {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{gtid}")?;
        }
        Ok(())
    }
}

/// A flavor-tagged replication position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Position {
    Mysql56(GtidSet),
    MariaDb(MariadbGtidSet),
    FilePos { file: String, pos: u64 },
}

impl Default for Position {
    fn default() -> Self {
        Position::Mysql56(GtidSet::new())
    }
}

impl Position {
    /// The zero position: nothing replicated yet.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_zero(&self) -> bool {
        match self {
            Position::Mysql56(set) => set.is_empty(),
            Position::MariaDb(set) => set.is_empty(),
            Position::FilePos { file, .. } => file.is_empty(),
        }
    }

    pub fn flavor(&self) -> Flavor {
        match self {
            Position::Mysql56(_) => Flavor::Mysql56,
            Position::MariaDb(_) => Flavor::MariaDb,
            Position::FilePos { .. } => Flavor::FilePos,
        }
    }

    /// Parse a position of a known flavor from its bare value form.
    pub fn parse(flavor: Flavor, s: &str) -> Result<Self> {
        match flavor {
            Flavor::Mysql56 => Ok(Position::Mysql56(GtidSet::parse(s)?)),
            Flavor::MariaDb => Ok(Position::MariaDb(MariadbGtidSet::parse(s)?)),
            Flavor::FilePos => {
                let s = s.trim();
                if s.is_empty() {
                    return Ok(Position::FilePos {
                        file: String::new(),
                        pos: 0,
                    });
                }
                let (file, pos) = s.rsplit_once(':').ok_or_else(|| {
                    TabletError::failed_precondition(format!("invalid file position {s:?}"))
                })?;
                Ok(Position::FilePos {
                    file: file.to_string(),
                    pos: pos.parse().map_err(|_| {
                        TabletError::failed_precondition(format!("invalid file offset in {s:?}"))
                    })?,
                })
            }
        }
    }

    /// Decode the canonical `Flavor/value` form. A bare value is taken to be
    /// MySQL56, which is how positions were stored before flavor prefixes.
    pub fn decode(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Position::empty());
        }
        match s.split_once('/') {
            Some(("MySQL56", rest)) => Self::parse(Flavor::Mysql56, rest),
            Some(("MariaDB", rest)) => Self::parse(Flavor::MariaDb, rest),
            Some(("FilePos", rest)) => Self::parse(Flavor::FilePos, rest),
            Some((flavor, _)) => Err(TabletError::failed_precondition(format!(
                "unknown position flavor {flavor:?}"
            ))),
            None => Self::parse(Flavor::Mysql56, s),
        }
    }

    /// Canonical prefixed encoding.
    pub fn encode(&self) -> String {
        if self.is_zero() {
            return String::new();
        }
        match self {
            Position::Mysql56(set) => format!("MySQL56/{set}"),
            Position::MariaDb(set) => format!("MariaDB/{set}"),
            Position::FilePos { file, pos } => format!("FilePos/{file}:{pos}"),
        }
    }

    /// Access the MySQL56 GTID set, failing for other flavors.
    pub fn gtid_set(&self) -> Result<&GtidSet> {
        match self {
            Position::Mysql56(set) => Ok(set),
            other => Err(TabletError::failed_precondition(format!(
                "expected a MySQL56 position, got {}",
                other.flavor().name()
            ))),
        }
    }

    /// True if every transaction in `self` is contained in `other`.
    pub fn subset_of(&self, other: &Position) -> Result<bool> {
        match (self, other) {
            (Position::Mysql56(a), Position::Mysql56(b)) => Ok(a.subset_of(b)),
            (Position::MariaDb(a), Position::MariaDb(b)) => Ok(a.subset_of(b)),
            (Position::FilePos { file: fa, pos: pa }, Position::FilePos { file: fb, pos: pb }) => {
                Ok((fa, pa) <= (fb, pb))
            }
            (a, b) => Err(flavor_mismatch(a, b)),
        }
    }

    pub fn union(&self, other: &Position) -> Result<Position> {
        if self.is_zero() {
            return Ok(other.clone());
        }
        if other.is_zero() {
            return Ok(self.clone());
        }
        match (self, other) {
            (Position::Mysql56(a), Position::Mysql56(b)) => Ok(Position::Mysql56(a.union(b))),
            (Position::MariaDb(a), Position::MariaDb(b)) => Ok(Position::MariaDb(a.union(b))),
            (Position::FilePos { file: fa, pos: pa }, Position::FilePos { file: fb, pos: pb }) => {
                if (fa, pa) >= (fb, pb) {
                    Ok(self.clone())
                } else {
                    Ok(other.clone())
                }
            }
            (a, b) => Err(flavor_mismatch(a, b)),
        }
    }

    /// `self \ other`.
    pub fn difference(&self, other: &Position) -> Result<Position> {
        match (self, other) {
            (Position::Mysql56(a), Position::Mysql56(b)) => Ok(Position::Mysql56(a.difference(b))),
            (Position::MariaDb(a), Position::MariaDb(b)) => Ok(Position::MariaDb(a.difference(b))),
            (Position::FilePos { .. }, Position::FilePos { .. }) => {
                if self.subset_of(other)? {
                    Ok(Position::FilePos {
                        file: String::new(),
                        pos: 0,
                    })
                } else {
                    Ok(self.clone())
                }
            }
            (a, b) => Err(flavor_mismatch(a, b)),
        }
    }

    /// True if the single transaction is contained in this position.
    pub fn contains_gtid(&self, gtid: &Gtid) -> bool {
        match self {
            Position::Mysql56(set) => set.contains(gtid),
            _ => false,
        }
    }

    /// Add one transaction to a MySQL56 position.
    pub fn add_gtid(&mut self, gtid: Gtid) -> Result<()> {
        match self {
            Position::Mysql56(set) => {
                set.add(gtid);
                Ok(())
            }
            other => Err(TabletError::failed_precondition(format!(
                "cannot add a GTID to a {} position",
                other.flavor().name()
            ))),
        }
    }
}

fn flavor_mismatch(a: &Position, b: &Position) -> TabletError {
    TabletError::failed_precondition(format!(
        "position flavor mismatch: {} vs {}",
        a.flavor().name(),
        b.flavor().name()
    ))
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl Serialize for Position {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Position {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Position::decode(&s).map_err(D::Error::custom)
    }
}
