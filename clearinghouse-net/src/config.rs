use clearinghouse_base::{err, Result};

/// One line of the config file: `<branch_id> <hostname> <port>`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BranchAddr {
    pub id: String,
    pub host: String,
    pub port: u16,
}

impl BranchAddr {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parses the newline-delimited branch list. Trailing blank lines are
/// ignored; any other malformed line is a hard error, which the binary
/// surfaces as a non-zero exit.
pub fn parse_config(contents: &str) -> Result<Vec<BranchAddr>> {
    let mut branches = Vec::new();
    for line in contents.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        let [id, host, port] = fields[..] else {
            return Err(err(format!(
                "config line must have exactly 3 fields, got {}: {line:?}",
                fields.len()
            )));
        };
        let port: u16 = port
            .parse()
            .map_err(|_| err(format!("invalid port {port:?} in config line {line:?}")))?;
        branches.push(BranchAddr {
            id: id.to_string(),
            host: host.to_string(),
            port,
        });
    }
    Ok(branches)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_well_formed_lines() {
        let cfg = "A localhost 5000\nB localhost 5001\n";
        let branches = parse_config(cfg).unwrap();
        assert_eq!(
            branches,
            vec![
                BranchAddr { id: "A".into(), host: "localhost".into(), port: 5000 },
                BranchAddr { id: "B".into(), host: "localhost".into(), port: 5001 },
            ]
        );
    }

    #[test]
    fn ignores_trailing_blank_lines() {
        let cfg = "A localhost 5000\n\n\n";
        assert_eq!(parse_config(cfg).unwrap().len(), 1);
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(parse_config("A localhost\n").is_err());
        assert!(parse_config("A localhost notaport\n").is_err());
    }
}
