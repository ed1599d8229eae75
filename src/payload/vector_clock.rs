use anyhow::bail;
use bit_set::BitSet;
use bytes::{Buf, BufMut};

use crate::link::host::HostId;

/// A process' local vector clock: entry `i` is the number of messages from process `i+1` that
///  were delivered locally.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ProcessVectorClock {
    entries: Vec<u32>,
}

impl ProcessVectorClock {
    pub fn new(num_processes: usize) -> ProcessVectorClock {
        ProcessVectorClock { entries: vec![0; num_processes] }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entry(&self, process: HostId) -> u32 {
        process.index()
            .and_then(|idx| self.entries.get(idx))
            .copied()
            .unwrap_or(0)
    }

    pub fn increment(&mut self, process: HostId) -> anyhow::Result<()> {
        match process.index().and_then(|idx| self.entries.get_mut(idx)) {
            Some(entry) => {
                *entry += 1;
                Ok(())
            }
            None => bail!("process {} is not covered by a vector clock of length {}", process, self.entries.len()),
        }
    }

    /// Takes a snapshot that only carries the entries of processes in `dependencies`, with the
    ///  sender's own entry stamped with its number of previous broadcasts.
    pub fn localized_snapshot(&self, dependencies: &BitSet, myself: HostId, own_broadcasts: u32) -> MessagePassedVectorClock {
        let entries = self.entries.iter()
            .enumerate()
            .map(|(idx, &entry)| {
                let process = HostId::new(idx as u32 + 1);
                if process == myself {
                    own_broadcasts
                }
                else if dependencies.contains(process.as_u32() as usize) {
                    entry
                }
                else {
                    0
                }
            })
            .collect();
        MessagePassedVectorClock { entries }
    }
}

/// Immutable vector clock snapshot that travels with a causal payload
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct MessagePassedVectorClock {
    entries: Vec<u32>,
}

impl MessagePassedVectorClock {
    pub fn from_entries(entries: Vec<u32>) -> MessagePassedVectorClock {
        MessagePassedVectorClock { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entry(&self, process: HostId) -> u32 {
        process.index()
            .and_then(|idx| self.entries.get(idx))
            .copied()
            .unwrap_or(0)
    }

    /// entrywise `<=`. Entries missing on either side count as 0.
    pub fn is_less_or_equal(&self, clock: &ProcessVectorClock) -> bool {
        self.entries.iter()
            .enumerate()
            .all(|(idx, &entry)| entry <= clock.entries.get(idx).copied().unwrap_or(0))
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        for &entry in &self.entries {
            buf.put_u32(entry);
        }
    }

    pub fn try_deser(buf: &mut impl Buf, num_processes: usize) -> anyhow::Result<MessagePassedVectorClock> {
        let mut entries = Vec::with_capacity(num_processes);
        for _ in 0..num_processes {
            entries.push(buf.try_get_u32()?);
        }
        Ok(MessagePassedVectorClock { entries })
    }
}
