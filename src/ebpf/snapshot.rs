//! One-shot snapshots through iterator programs
//!
//! Task iterators see every task from the host namespaces and are read
//! once. Socket iterators only see the sockets of the network namespace
//! they are read from, so they are read once per distinct namespace of the
//! tracked containers, entering it through one of its processes.

use super::attach::IterScope;
use super::decode::EventDecoder;
use super::events::Event;
use super::kernel::IterLink;
use crate::container::{Container, NetnsRunner};
use crate::{ProbekitError, Result};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Iterator link retained for snapshotting
#[derive(Clone)]
pub struct SnapshotLink {
    pub program: String,
    pub scope: IterScope,
    pub link: Arc<dyn IterLink>,
}

/// Splits iterator output into whole records.
///
/// A trailing partial record is dropped.
pub fn split_records(data: Bytes, record_size: usize) -> Vec<Bytes> {
    if record_size == 0 {
        warn!("Record size is 0, discarding {} bytes", data.len());
        return Vec::new();
    }

    let count = data.len() / record_size;
    let tail = data.len() % record_size;
    if tail != 0 {
        debug!(
            "Dropping {} trailing bytes after {} records of {} bytes",
            tail, count, record_size
        );
    }

    (0..count)
        .map(|i| data.slice(i * record_size..(i + 1) * record_size))
        .collect()
}

/// Runs every snapshot link in order and returns all decoded events
pub fn run_snapshot(
    links: &[SnapshotLink],
    containers: &[Container],
    netns: &dyn NetnsRunner,
    decoder: &EventDecoder,
) -> Result<Vec<Event>> {
    let mut events = Vec::new();

    for link in links {
        let before = events.len();
        match link.scope {
            IterScope::Task => {
                let buf = link.link.read_all()?;
                events.extend(decode_all(Bytes::from(buf), decoder, None));
            }
            IterScope::Tcp | IterScope::Udp => {
                events.extend(run_in_all_netns(link, containers, netns, decoder)?);
            }
        }
        debug!(
            "Iterator {} ({}) produced {} events",
            link.program,
            link.scope,
            events.len() - before
        );
    }

    Ok(events)
}

fn run_in_all_netns(
    link: &SnapshotLink,
    containers: &[Container],
    netns: &dyn NetnsRunner,
    decoder: &EventDecoder,
) -> Result<Vec<Event>> {
    let mut by_netns: BTreeMap<u64, Vec<&Container>> = BTreeMap::new();
    for container in containers {
        by_netns.entry(container.netns).or_default().push(container);
    }

    let mut events = Vec::new();
    for (netns_id, candidates) in by_netns {
        match read_in_netns(link.link.as_ref(), &candidates, netns)? {
            Some(buf) => events.extend(decode_all(Bytes::from(buf), decoder, Some(netns_id))),
            None => warn!(
                "Skipping network namespace {}: none of its {} containers can be entered",
                netns_id,
                candidates.len()
            ),
        }
    }

    Ok(events)
}

/// Reads the iterator from inside the namespace shared by `candidates`.
///
/// A container whose process already exited is skipped in favour of the
/// next one; `None` when none is left.
fn read_in_netns(
    link: &dyn IterLink,
    candidates: &[&Container],
    netns: &dyn NetnsRunner,
) -> Result<Option<Vec<u8>>> {
    for container in candidates {
        let mut buf = None;
        let result = netns.run_in(container.pid, &mut || {
            buf = Some(link.read_all()?);
            Ok(())
        });

        match result {
            Ok(()) => return Ok(buf),
            Err(ProbekitError::ProcessGone(pid)) => {
                debug!(
                    "Process {} of container {} is gone, trying another one",
                    pid, container.id
                );
            }
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

fn decode_all(data: Bytes, decoder: &EventDecoder, netns_id: Option<u64>) -> Vec<Event> {
    split_records(data, decoder.plan().record_size)
        .into_iter()
        .map(|record| {
            let mut event = decoder.decode(record);
            if netns_id.is_some() {
                event.netns_id = netns_id;
            }
            event
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_records_drops_partial_tail() {
        let data = Bytes::from_static(&[1, 1, 1, 2, 2, 2, 3, 3]);
        let records = split_records(data, 3);

        assert_eq!(
            records,
            vec![
                Bytes::from_static(&[1, 1, 1]),
                Bytes::from_static(&[2, 2, 2]),
            ]
        );
    }

    #[test]
    fn test_split_records_edge_cases() {
        assert!(split_records(Bytes::new(), 8).is_empty());
        assert!(split_records(Bytes::from_static(&[0; 7]), 8).is_empty());
        assert!(split_records(Bytes::from_static(&[0; 8]), 0).is_empty());
        assert_eq!(split_records(Bytes::from_static(&[0; 16]), 8).len(), 2);
    }
}
