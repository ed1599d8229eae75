use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use anyhow::{anyhow, Context};

use crate::link::host::{Host, HostId};

/// Parses a host table with one `id ip port` triple per line. Blank lines are ignored.
pub fn parse_hosts(s: &str) -> anyhow::Result<Vec<Host>> {
    s.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| parse_line(line)
            .with_context(|| format!("line {} of hosts file: {:?}", idx+1, line))
        )
        .collect()
}

fn parse_line(line: &str) -> anyhow::Result<Host> {
    let mut parts = line.split_whitespace();
    let mut next = |name: &str| parts.next()
        .ok_or_else(|| anyhow!("missing {}", name));

    let id: u32 = next("id")?.parse()?;
    let ip: IpAddr = next("ip")?.parse()?;
    let port: u16 = next("port")?.parse()?;

    if let Some(extra) = parts.next() {
        anyhow::bail!("unexpected trailing content {:?}", extra);
    }
    Ok(Host::new(HostId::new(id), SocketAddr::new(ip, port)))
}

pub async fn read_hosts_file(path: &Path) -> anyhow::Result<Vec<Host>> {
    let content = tokio::fs::read_to_string(path).await
        .with_context(|| format!("reading hosts file {:?}", path))?;
    parse_hosts(&content)
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn host(id: u32, addr: &str) -> Host {
        Host::new(HostId::new(id), addr.parse().unwrap())
    }

    #[rstest]
    #[case::single("1 127.0.0.1 11001", vec![host(1, "127.0.0.1:11001")])]
    #[case::several("1 127.0.0.1 11001\n2 10.0.0.2 11002\n", vec![host(1, "127.0.0.1:11001"), host(2, "10.0.0.2:11002")])]
    #[case::blank_lines("\n1 127.0.0.1 11001\n   \n2 127.0.0.1 11002\n\n", vec![host(1, "127.0.0.1:11001"), host(2, "127.0.0.1:11002")])]
    #[case::extra_whitespace("  3\t127.0.0.1   11003  ", vec![host(3, "127.0.0.1:11003")])]
    #[case::empty("", vec![])]
    fn test_parse_hosts(#[case] s: &str, #[case] expected: Vec<Host>) {
        assert_eq!(parse_hosts(s).unwrap(), expected);
    }

    #[rstest]
    #[case::missing_port("1 127.0.0.1")]
    #[case::bad_ip("1 localhost 11001")]
    #[case::bad_id("x 127.0.0.1 11001")]
    #[case::negative_id("-1 127.0.0.1 11001")]
    #[case::port_out_of_range("1 127.0.0.1 70000")]
    #[case::trailing("1 127.0.0.1 11001 x")]
    fn test_parse_hosts_invalid(#[case] s: &str) {
        assert!(parse_hosts(s).is_err());
    }

    #[test]
    fn test_error_names_line() {
        let msg = format!("{:#}", parse_hosts("1 127.0.0.1 11001\n2 127.0.0.1").unwrap_err());
        assert!(msg.contains("line 2"), "{}", msg);
    }
}
