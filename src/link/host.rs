use std::fmt::{Debug, Display, Formatter};
use std::net::SocketAddr;

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut};

/// A process' id. Ids are 1-based and contiguous, so they double as vector clock indices.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct HostId(u32);

impl Debug for HostId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "H{}", self.0)
    }
}

impl Display for HostId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl HostId {
    pub const fn new(id: u32) -> HostId {
        HostId(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// zero-based index, `None` for the (invalid) id 0
    pub fn index(&self) -> Option<usize> {
        (self.0 as usize).checked_sub(1)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.0);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<HostId> {
        Ok(HostId(buf.try_get_u32()?))
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Host {
    pub id: HostId,
    pub socket_addr: SocketAddr,
}

impl Host {
    pub fn new(id: HostId, socket_addr: SocketAddr) -> Host {
        Host { id, socket_addr }
    }
}

/// Immutable table of all processes, resolving ids to hosts.
#[derive(Debug, Clone)]
pub struct HostResolver {
    myself: HostId,
    /// sorted by id, `hosts[i].id == i+1`
    hosts: Vec<Host>,
}

impl HostResolver {
    pub fn new(myself: HostId, mut hosts: Vec<Host>) -> anyhow::Result<HostResolver> {
        if hosts.is_empty() {
            bail!("no hosts configured");
        }

        hosts.sort_by_key(|h| h.id);
        for (i, host) in hosts.iter().enumerate() {
            if host.id.index() != Some(i) {
                bail!("host ids must be unique and contiguous starting at 1, found {} at position {}", host.id, i+1);
            }
        }

        let resolver = HostResolver { myself, hosts };
        if resolver.get(myself).is_err() {
            bail!("own id {} is not in the host table", myself);
        }
        Ok(resolver)
    }

    pub fn my_id(&self) -> HostId {
        self.myself
    }

    pub fn myself(&self) -> &Host {
        // validated during construction
        &self.hosts[self.myself.index().unwrap_or_default()]
    }

    pub fn get(&self, id: HostId) -> anyhow::Result<&Host> {
        id.index()
            .and_then(|idx| self.hosts.get(idx))
            .ok_or_else(|| anyhow!("unknown host id {}", id))
    }

    pub fn num_hosts(&self) -> usize {
        self.hosts.len()
    }

    pub fn all(&self) -> impl Iterator<Item=&Host> {
        self.hosts.iter()
    }

    pub fn others(&self) -> impl Iterator<Item=&Host> {
        let myself = self.myself;
        self.hosts.iter()
            .filter(move |h| h.id != myself)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn host(id: u32) -> Host {
        Host::new(HostId::new(id), SocketAddr::from(([127, 0, 0, 1], 11000 + id as u16)))
    }

    #[test]
    fn test_resolve() {
        let resolver = HostResolver::new(HostId::new(2), vec![host(3), host(1), host(2)]).unwrap();

        assert_eq!(resolver.num_hosts(), 3);
        assert_eq!(resolver.myself(), &host(2));
        assert_eq!(resolver.get(HostId::new(3)).unwrap(), &host(3));
        assert_eq!(resolver.others().map(|h| h.id.as_u32()).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(resolver.all().count(), 3);
    }

    #[rstest]
    #[case::zero(0)]
    #[case::too_big(4)]
    fn test_resolve_unknown(#[case] id: u32) {
        let resolver = HostResolver::new(HostId::new(1), vec![host(1), host(2), host(3)]).unwrap();
        assert!(resolver.get(HostId::new(id)).is_err());
    }

    #[rstest]
    #[case::empty(1, vec![])]
    #[case::gap(1, vec![host(1), host(3)])]
    #[case::duplicate(1, vec![host(1), host(1), host(2)])]
    #[case::zero_based(1, vec![host(0), host(1)])]
    #[case::myself_missing(5, vec![host(1), host(2)])]
    fn test_invalid_table(#[case] myself: u32, #[case] hosts: Vec<Host>) {
        assert!(HostResolver::new(HostId::new(myself), hosts).is_err());
    }

    #[test]
    fn test_id_wire_format() {
        let mut buf = Vec::new();
        HostId::new(0x01020304).ser(&mut buf);
        assert_eq!(buf, vec![1, 2, 3, 4]);

        assert_eq!(HostId::try_deser(&mut buf.as_slice()).unwrap(), HostId::new(0x01020304));
        assert!(HostId::try_deser(&mut &buf[..3]).is_err());
    }
}
