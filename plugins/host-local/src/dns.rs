//! resolv.conf parsing
use std::path::Path;

use cni_core::prelude::*;

/// read the resolver config at `path`
pub async fn parse(path: &Path) -> Result<Dns> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read resolv.conf {}", path.display()))?;
    Ok(parse_str(&contents))
}

/// Only `nameserver`, `domain`, `search` & `options` are understood, other
/// lines are skipped.
pub fn parse_str(contents: &str) -> Dns {
    let mut dns = Dns::default();
    for line in contents.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let fields = line.split_whitespace().collect::<Vec<_>>();
        let [key, first, rest @ ..] = fields.as_slice() else {
            continue;
        };
        match *key {
            "nameserver" => dns.nameservers.push((*first).to_owned()),
            "domain" => dns.domain = Some((*first).to_owned()),
            "search" => dns
                .search
                .extend(std::iter::once(first).chain(rest).map(|s| (*s).to_owned())),
            "options" => dns
                .options
                .extend(std::iter::once(first).chain(rest).map(|s| (*s).to_owned())),
            _ => {}
        }
    }
    dns
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_parse_str() {
        let dns = parse_str(
            "# generated\n\
             nameserver 10.0.0.10\n\
             ; old style comment\n\
             nameserver   2001:db8::53  \n\
             domain example.com\n\
             search a.example.com b.example.com\n\
             options ndots:5 edns0\n\
             sortlist\n\
             \n\
             unknown thing\n",
        );
        assert_eq!(dns.nameservers, ["10.0.0.10", "2001:db8::53"]);
        assert_eq!(dns.domain.as_deref(), Some("example.com"));
        assert_eq!(dns.search, ["a.example.com", "b.example.com"]);
        assert_eq!(dns.options, ["ndots:5", "edns0"]);
    }

    #[test]
    fn test_parse_empty() {
        assert!(parse_str("").is_empty());
        assert!(parse_str("# only a comment\n").is_empty());
    }

    #[tokio::test]
    async fn test_parse_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "nameserver 192.0.2.53").unwrap();
        let dns = parse(file.path()).await.unwrap();
        assert_eq!(dns.nameservers, ["192.0.2.53"]);

        let dir = tempfile::tempdir().unwrap();
        let err = parse(&dir.path().join("missing")).await.unwrap_err();
        assert!(err.to_string().starts_with("failed to read resolv.conf"));
    }
}
