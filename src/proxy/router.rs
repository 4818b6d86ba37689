//! Lexical read/write classifier.
//!
//! The rule is deliberately cheap and deterministic: the first keyword token
//! decides. `SELECT`, `SHOW` and `EXPLAIN` route to the reader, everything
//! else (including WITH/CTE and compound statements) fans out to the
//! writers. The empty string counts as a write, the safe default.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Read,
    Write,
}

const READ_KEYWORDS: [&str; 3] = ["SELECT", "SHOW", "EXPLAIN"];

pub fn classify(sql: &str) -> QueryKind {
    let trimmed = sql.trim_start();

    let token_end = trimmed
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(trimmed.len());
    let token = &trimmed[..token_end];

    if READ_KEYWORDS
        .iter()
        .any(|kw| token.eq_ignore_ascii_case(kw))
    {
        QueryKind::Read
    } else {
        QueryKind::Write
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads() {
        assert_eq!(classify("SELECT * FROM t"), QueryKind::Read);
        assert_eq!(classify("  seLECT 1"), QueryKind::Read);
        assert_eq!(classify("\n\tselect 1"), QueryKind::Read);
        assert_eq!(classify("SHOW server_version"), QueryKind::Read);
        assert_eq!(classify("EXPLAIN SELECT 1"), QueryKind::Read);
        assert_eq!(classify("explain analyze select 1"), QueryKind::Read);
        assert_eq!(classify("SELECT(1)"), QueryKind::Read);
    }

    #[test]
    fn test_writes() {
        assert_eq!(classify("INSERT INTO t VALUES (1)"), QueryKind::Write);
        assert_eq!(classify("UPDATE t SET a = 1"), QueryKind::Write);
        assert_eq!(classify("DELETE FROM t"), QueryKind::Write);
        assert_eq!(classify("CREATE TABLE t (a int)"), QueryKind::Write);
        assert_eq!(classify("TRUNCATE t"), QueryKind::Write);
        // CTEs take the safe route even when they only read
        assert_eq!(
            classify("WITH x AS (SELECT 1) INSERT INTO t SELECT * FROM x"),
            QueryKind::Write
        );
        assert_eq!(classify("WITH x AS (SELECT 1) SELECT * FROM x"), QueryKind::Write);
    }

    #[test]
    fn test_edge_cases() {
        assert_eq!(classify(""), QueryKind::Write);
        assert_eq!(classify("   "), QueryKind::Write);
        assert_eq!(classify("SELECTX FROM t"), QueryKind::Write);
        assert_eq!(classify("123"), QueryKind::Write);
    }
}
