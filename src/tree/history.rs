//! Time travel
//!
//! Walks the `prev_hash` chain to find the version of a node that was current
//! at a past instant, and opens read-only views named `base@when`.

use super::graph::NodeGraph;
use super::node::{ChildSlot, DNode, EntryAttrs, NodeAttrs, NodeKind, NodeRecord};
use super::source::RemoteSource;
use crate::error::FsError;
use crate::types::{short_hex, Hash, NodeId};
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone};
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

/// Suffix that lists every stored version
pub const VERSIONS_SPEC: &str = "versions";

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%m-%d-%Y %H:%M:%S",
    "%m-%d-%Y %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m-%d-%Y", "%Y/%m/%d", "%m/%d/%Y"];

/// What a `base@when` name asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSpec {
    /// Directory of all versions
    Versions,
    /// The version current at this instant
    At(SystemTime),
}

/// Parse the part after `@`: `versions`, a local date/time, or a signed
/// duration relative to `now` such as `-53m` or `-1h30m`
pub fn parse_time_spec(spec: &str, now: SystemTime) -> Result<TimeSpec, FsError> {
    let spec = spec.trim();
    if spec == VERSIONS_SPEC {
        return Ok(TimeSpec::Versions);
    }
    if let Some(instant) = parse_local_time(spec) {
        return Ok(TimeSpec::At(instant));
    }
    if let Some((negative, offset)) = parse_duration(spec) {
        let instant = if negative {
            now.checked_sub(offset)
        } else {
            now.checked_add(offset)
        };
        return instant
            .map(TimeSpec::At)
            .ok_or_else(|| FsError::InvalidOperation(format!("time '{}' out of range", spec)));
    }
    Err(FsError::InvalidOperation(format!("unrecognized time '{}'", spec)))
}

fn parse_local_time(s: &str) -> Option<SystemTime> {
    let naive = DATETIME_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|f| NaiveDate::parse_from_str(s, f).ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(SystemTime::from)
}

fn parse_duration(s: &str) -> Option<(bool, Duration)> {
    let (negative, rest) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let mut seconds = 0f64;
    let mut number = String::new();
    let mut saw_unit = false;
    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }
        let scale = match c {
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                0.001
            }
            's' => 1.0,
            'm' => 60.0,
            'h' => 3600.0,
            'd' => 86400.0,
            _ => return None,
        };
        let value: f64 = number.parse().ok()?;
        number.clear();
        seconds += value * scale;
        saw_unit = true;
    }
    if !saw_unit || !number.is_empty() || !seconds.is_finite() {
        return None;
    }
    Some((negative, Duration::from_secs_f64(seconds)))
}

/// Entry name for one version inside a `@versions` directory
pub fn version_entry_name(base: &str, mtime: SystemTime) -> String {
    let local: DateTime<Local> = mtime.into();
    format!("{}.{}", base, local.format("%Y-%-m-%-d %H:%M:%S"))
}

impl NodeGraph {
    /// The version of `id` that was current at `instant`
    ///
    /// Falls back to the oldest reachable version when the chain ends first.
    pub async fn reconstruct_as_of(
        &self,
        id: NodeId,
        instant: SystemTime,
        remote: &dyn RemoteSource,
    ) -> Result<(Hash, NodeRecord), FsError> {
        let node = self.node(id)?;
        let mut hash = node.content_hash().ok_or_else(|| {
            FsError::NotFound(format!("'{}' has no persisted version", node.name))
        })?;
        let mut record = self.load_record(remote, node.owner, &hash).await?;

        while record.attrs.mtime > instant {
            let Some(prev) = record.prev_hash else {
                break;
            };
            match self.load_record(remote, record.owner, &prev).await {
                Ok(older) => {
                    hash = prev;
                    record = older;
                }
                Err(FsError::NotFound(_)) => {
                    warn!(hash = %short_hex(&prev), "Version chain ends early");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok((hash, record))
    }

    /// Every reachable version of `id`, newest first
    pub async fn versions(
        &self,
        id: NodeId,
        remote: &dyn RemoteSource,
    ) -> Result<Vec<(Hash, NodeRecord)>, FsError> {
        let node = self.node(id)?;
        let Some(mut next) = node.content_hash() else {
            return Ok(Vec::new());
        };
        let mut owner = node.owner;
        let mut chain = Vec::new();
        loop {
            match self.load_record(remote, owner, &next).await {
                Ok(record) => {
                    owner = record.owner;
                    let prev = record.prev_hash;
                    chain.push((next, record));
                    match prev {
                        Some(p) => next = p,
                        None => break,
                    }
                }
                Err(FsError::NotFound(_)) if !chain.is_empty() => break,
                Err(e) => return Err(e),
            }
        }
        Ok(chain)
    }

    /// Open a read-only view of `base` in `parent` selected by `when`
    pub(super) async fn open_historical(
        &mut self,
        parent: NodeId,
        base: &str,
        when: &str,
        remote: &dyn RemoteSource,
    ) -> Result<NodeId, FsError> {
        let view_name = format!("{}@{}", base, when);
        let target = self.materialize(parent, base, remote).await?;

        let mut view = match parse_time_spec(when, SystemTime::now())? {
            TimeSpec::At(instant) => {
                let (hash, record) = self.reconstruct_as_of(target, instant, remote).await?;
                DNode::from_record(record, hash)
            }
            TimeSpec::Versions => {
                let versions = self.versions(target, remote).await?;
                let (entry, mtime, version, owner) = {
                    let current = self.node(target)?;
                    let entry = EntryAttrs {
                        perm: 0o555,
                        uid: current.attrs.uid,
                        gid: current.attrs.gid,
                    };
                    (entry, current.attrs.mtime, current.version, current.owner)
                };
                let inode = self.next_inode;
                self.next_inode += 1;
                let attrs = NodeAttrs::new(inode, NodeKind::Directory, &entry, mtime);
                let mut dir = DNode::new(&view_name, attrs, version, owner);
                for (hash, record) in versions {
                    let mut name = version_entry_name(base, record.attrs.mtime);
                    if dir.children.contains_key(&name) {
                        name = format!("{} v{}", name, record.version);
                    }
                    dir.children.insert(name, ChildSlot::Unloaded(hash));
                }
                dir
            }
        };
        view.parent = Some(parent);
        view.archived = true;
        let id = self.insert(view);
        self.views.insert((parent, view_name.clone()), id);
        info!(view = %view_name, "Opened historical view");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::graph::tests::graph;
    use crate::tree::source::Offline;

    #[test]
    fn test_parse_versions_and_durations() {
        let now = SystemTime::now();
        assert_eq!(parse_time_spec("versions", now).unwrap(), TimeSpec::Versions);
        assert_eq!(
            parse_time_spec("-53m", now).unwrap(),
            TimeSpec::At(now - Duration::from_secs(53 * 60))
        );
        assert_eq!(
            parse_time_spec("-1h30m", now).unwrap(),
            TimeSpec::At(now - Duration::from_secs(5400))
        );
        assert_eq!(
            parse_time_spec("+10s", now).unwrap(),
            TimeSpec::At(now + Duration::from_secs(10))
        );
        assert!(parse_time_spec("yesterday", now).is_err());
        assert!(parse_time_spec("-5", now).is_err());
    }

    #[test]
    fn test_parse_absolute_times() {
        let now = SystemTime::now();
        let expected: SystemTime = Local
            .with_ymd_and_hms(2014, 3, 25, 2, 1, 3)
            .earliest()
            .unwrap()
            .into();
        assert_eq!(
            parse_time_spec("2014-03-25 02:01:03", now).unwrap(),
            TimeSpec::At(expected)
        );
        assert_eq!(
            parse_time_spec("3/25/2014 02:01:03", now).unwrap(),
            TimeSpec::At(expected)
        );

        let midnight: SystemTime = Local
            .with_ymd_and_hms(2014, 3, 25, 0, 0, 0)
            .earliest()
            .unwrap()
            .into();
        assert_eq!(parse_time_spec("2014/3/25", now).unwrap(), TimeSpec::At(midnight));
        assert_eq!(parse_time_spec("3-25-2014", now).unwrap(), TimeSpec::At(midnight));
    }

    #[tokio::test]
    async fn test_reconstruct_as_of_picks_the_version_in_force() {
        let mut g = graph(1);
        let root = g.root();
        let f = g.create(root, "f", &EntryAttrs::file()).unwrap();
        let mut written = Vec::new();
        for content in [b"one", b"two", b"six"] {
            g.write(f, 0, content, &Offline).await.unwrap();
            g.flush_root().unwrap();
            let node = g.node(f).unwrap();
            written.push((node.content_hash().unwrap(), node.attrs.mtime));
        }
        let (h1, t1) = written[0];
        let (h2, t2) = written[1];
        let (h3, t3) = written[2];
        assert!(t1 < t2 && t2 < t3);

        let cases = [
            (t1, h1),
            (t2 - Duration::from_nanos(1), h1),
            (t2, h2),
            (t3, h3),
            (t3 + Duration::from_secs(3600), h3),
            // before the first version: the oldest one
            (t1 - Duration::from_secs(60), h1),
        ];
        for (instant, expected) in cases {
            let (hash, record) = g.reconstruct_as_of(f, instant, &Offline).await.unwrap();
            assert_eq!(hash, expected);
            assert!(record.attrs.mtime <= instant || hash == h1);
        }
    }

    #[tokio::test]
    async fn test_versions_view_lists_every_version_read_only() {
        let mut g = graph(1);
        let root = g.root();
        let f = g.create(root, "f", &EntryAttrs::file()).unwrap();
        for content in [b"aa", b"bb", b"cc"] {
            g.write(f, 0, content, &Offline).await.unwrap();
            g.flush_root().unwrap();
        }

        let view = g.lookup(root, "f@versions", &Offline).await.unwrap();
        assert!(g.node(view).unwrap().is_archived());
        assert_eq!(g.lookup(root, "f@versions", &Offline).await.unwrap(), view);
        // views are never recorded in the parent
        assert!(!g.node(root).unwrap().children.contains_key("f@versions"));
        assert!(!g.is_dirty());

        let entries = g.read_dir(view, &Offline).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| e.name.starts_with("f.")));

        let mut contents = Vec::new();
        for entry in &entries {
            let id = g.lookup(view, &entry.name, &Offline).await.unwrap();
            assert!(g.node(id).unwrap().is_archived());
            contents.push(g.read(id, &Offline).await.unwrap());
            assert!(matches!(
                g.write(id, 0, b"zz", &Offline).await,
                Err(FsError::PermissionDenied(_))
            ));
        }
        contents.sort();
        assert_eq!(contents, vec![b"aa".to_vec(), b"bb".to_vec(), b"cc".to_vec()]);

        assert!(matches!(
            g.create(view, "new", &EntryAttrs::file()),
            Err(FsError::PermissionDenied(_))
        ));
        let first = entries[0].name.clone();
        assert!(matches!(g.remove(view, &first), Err(FsError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_time_view_is_archived_all_the_way_down() {
        let mut g = graph(1);
        let root = g.root();
        let d = g.mkdir(root, "d", &EntryAttrs::dir()).unwrap();
        let f = g.create(d, "inner", &EntryAttrs::file()).unwrap();
        g.write(f, 0, b"old", &Offline).await.unwrap();
        g.flush_root().unwrap();

        let view = g.lookup(root, "d@+1h", &Offline).await.unwrap();
        assert!(g.node(view).unwrap().is_archived());
        let inner = g.lookup(view, "inner", &Offline).await.unwrap();
        assert_ne!(inner, f);
        assert!(g.node(inner).unwrap().is_archived());
        assert_eq!(g.read(inner, &Offline).await.unwrap(), b"old".to_vec());

        assert!(matches!(
            g.write(inner, 0, b"new", &Offline).await,
            Err(FsError::PermissionDenied(_))
        ));
        assert!(matches!(
            g.mkdir(view, "sub", &EntryAttrs::dir()),
            Err(FsError::PermissionDenied(_))
        ));
        assert!(matches!(
            g.rename(view, "inner", root, "stolen", &Offline).await,
            Err(FsError::PermissionDenied(_))
        ));
        assert!(matches!(
            g.set_attr(inner, &Default::default(), &Offline).await,
            Err(FsError::PermissionDenied(_))
        ));
        // live tree untouched
        assert_eq!(g.read(f, &Offline).await.unwrap(), b"old".to_vec());
        assert_eq!(g.node_by_inode(g.get_attr(f).unwrap().inode), Some(f));
    }
}
