use clearinghouse_base::ProtocolError;

/// A parsed client command. The coordinator parses the client's line once
/// to learn the target branch/account; the same parser runs again on the
/// participant after the coordinator forwards the line verbatim, so the
/// wire text and the parsed form never drift apart.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Deposit { branch: String, account: String, value: i64 },
    Withdraw { branch: String, account: String, value: i64 },
    Balance { branch: String, account: String },
    Commit,
    Abort,
}

impl Command {
    pub fn parse(line: &str) -> Result<Command, ProtocolError> {
        let mut parts = line.trim().split_whitespace();
        let verb = parts
            .next()
            .ok_or_else(|| ProtocolError::malformed("empty command"))?;
        match verb {
            "COMMIT" => Ok(Command::Commit),
            "ABORT" => Ok(Command::Abort),
            "DEPOSIT" | "WITHDRAW" => {
                let (branch, account) = parse_target(&mut parts)?;
                let value = parse_value(&mut parts)?;
                if verb == "DEPOSIT" {
                    Ok(Command::Deposit { branch, account, value })
                } else {
                    Ok(Command::Withdraw { branch, account, value })
                }
            }
            "BALANCE" => {
                let (branch, account) = parse_target(&mut parts)?;
                Ok(Command::Balance { branch, account })
            }
            other => Err(ProtocolError::malformed(format!("unrecognized command {other:?}"))),
        }
    }
}

fn parse_target<'a>(parts: &mut impl Iterator<Item = &'a str>) -> Result<(String, String), ProtocolError> {
    let target = parts
        .next()
        .ok_or_else(|| ProtocolError::malformed("missing BRANCH.ACCOUNT"))?;
    let (branch, account) = target
        .split_once('.')
        .ok_or_else(|| ProtocolError::malformed(format!("{target:?} is not BRANCH.ACCOUNT")))?;
    Ok((branch.to_string(), account.to_string()))
}

fn parse_value<'a>(parts: &mut impl Iterator<Item = &'a str>) -> Result<i64, ProtocolError> {
    parts
        .next()
        .ok_or_else(|| ProtocolError::malformed("missing amount"))?
        .parse()
        .map_err(|_| ProtocolError::malformed("amount must be a signed integer"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_deposit() {
        assert_eq!(
            Command::parse("DEPOSIT A.x 10").unwrap(),
            Command::Deposit { branch: "A".into(), account: "x".into(), value: 10 }
        );
    }

    #[test]
    fn parses_negative_withdraw_amount_as_malformed_is_not_special_cased() {
        assert_eq!(
            Command::parse("WITHDRAW A.x -5").unwrap(),
            Command::Withdraw { branch: "A".into(), account: "x".into(), value: -5 }
        );
    }

    #[test]
    fn parses_balance() {
        assert_eq!(
            Command::parse("BALANCE A.x").unwrap(),
            Command::Balance { branch: "A".into(), account: "x".into() }
        );
    }

    #[test]
    fn parses_commit_and_abort() {
        assert_eq!(Command::parse("COMMIT").unwrap(), Command::Commit);
        assert_eq!(Command::parse("ABORT").unwrap(), Command::Abort);
    }

    #[test]
    fn rejects_unknown_verb() {
        assert!(Command::parse("FROB A.x 1").is_err());
    }

    #[test]
    fn rejects_missing_dot() {
        assert!(Command::parse("DEPOSIT Ax 10").is_err());
    }

    #[test]
    fn rejects_non_integer_amount() {
        assert!(Command::parse("DEPOSIT A.x ten").is_err());
    }
}
