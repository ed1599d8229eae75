use std::path::Path;

use anyhow::{anyhow, bail, Context};
use bit_set::BitSet;
use rustc_hash::FxHashMap;

use crate::link::host::HostId;

/// What a process does in a run: how many messages it broadcasts, and in causal mode which
///  processes its broadcasts depend on.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RunConfig {
    pub num_messages: u32,
    /// by process, the ids of the processes it depends on
    dependencies: FxHashMap<HostId, BitSet>,
}

impl RunConfig {
    /// The first line holds the number of messages. Each following non-blank line is
    ///  `p d1 d2 ...`, declaring that `p` depends on processes `d1 d2 ...`. A process listing
    ///  itself is ignored.
    pub fn parse(s: &str) -> anyhow::Result<RunConfig> {
        let mut lines = s.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty());

        let (_, first) = lines.next()
            .ok_or_else(|| anyhow!("empty run config"))?;
        let num_messages = first.trim().parse::<u32>()
            .with_context(|| format!("number of messages: {:?}", first))?;

        let mut dependencies = FxHashMap::default();
        for (idx, line) in lines {
            let (process, deps) = Self::parse_dependency_line(line)
                .with_context(|| format!("line {} of run config: {:?}", idx+1, line))?;
            if dependencies.insert(process, deps).is_some() {
                bail!("duplicate dependency line for process {}", process);
            }
        }

        Ok(RunConfig { num_messages, dependencies })
    }

    fn parse_dependency_line(line: &str) -> anyhow::Result<(HostId, BitSet)> {
        let mut ids = line.split_whitespace()
            .map(|s| s.parse::<u32>()
                .map_err(|e| anyhow!("{:?}: {}", s, e))
                .and_then(|id| if id == 0 { Err(anyhow!("process id 0")) } else { Ok(id) })
            );

        let process = ids.next()
            .ok_or_else(|| anyhow!("missing process id"))??;

        let mut deps = BitSet::new();
        for dep in ids {
            let dep = dep?;
            if dep != process {
                deps.insert(dep as usize);
            }
        }
        Ok((HostId::new(process), deps))
    }

    pub async fn read_file(path: &Path) -> anyhow::Result<RunConfig> {
        let content = tokio::fs::read_to_string(path).await
            .with_context(|| format!("reading run config {:?}", path))?;
        Self::parse(&content)
    }

    /// The dependencies of a process, by host id. Processes without a line have none.
    pub fn dependencies_of(&self, process: HostId) -> BitSet {
        self.dependencies.get(&process)
            .cloned()
            .unwrap_or_default()
    }

    /// Checks that all processes named in dependency lines are part of a run with `num_hosts`
    ///  processes
    pub fn validate(&self, num_hosts: usize) -> anyhow::Result<()> {
        for (process, deps) in &self.dependencies {
            let out_of_range = |id: usize| id == 0 || id > num_hosts;
            if out_of_range(process.as_u32() as usize) {
                bail!("dependency line for unknown process {}", process);
            }
            if let Some(unknown) = deps.iter().find(|&id| out_of_range(id)) {
                bail!("process {} depends on unknown process {}", process, unknown);
            }
        }
        Ok(())
    }
}
