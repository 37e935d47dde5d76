//! Lexical, operational and temporal features derived without parsing.

use chrono::NaiveTime;
use once_cell::sync::Lazy;
use regex::Regex;

static HEX_LITERAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"0x[0-9a-fA-F]+").unwrap());
static SELECT_STAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)\bselect\s+\*").unwrap());

/// Built-ins abused for time-based injection and file access.
const SUSPICIOUS_FUNCS: &[&str] =
    &["SLEEP(", "BENCHMARK(", "UPDATEXML(", "EXTRACTVALUE(", "LOAD_FILE("];

/// MySQL schemas owned by the server itself.
const SYSTEM_SCHEMAS: &[&str] = &["mysql", "sys", "information_schema", "performance_schema"];

const WRITE_PREFIXES: &[&str] = &["insert", "update", "delete", "replace"];
const DDL_PREFIXES: &[&str] = &["create", "alter", "drop", "truncate", "rename"];

/// Shannon entropy (base 2) over byte frequencies; 0 for empty input.
pub fn shannon_entropy(text: &str) -> f64 {
    let bytes = text.as_bytes();
    if bytes.is_empty() {
        return 0.0;
    }
    let mut counts = [0usize; 256];
    for b in bytes {
        counts[*b as usize] += 1;
    }
    let len = bytes.len() as f64;
    let mut entropy = 0.0;
    for count in counts {
        if count > 0 {
            let p = count as f64 / len;
            entropy -= p * p.log2();
        }
    }
    entropy
}

pub fn has_comment(sql: &str) -> bool {
    sql.contains("--") || sql.contains("/*") || sql.contains('#')
}

pub fn has_hex_literal(sql: &str) -> bool {
    HEX_LITERAL.is_match(sql)
}

pub fn is_select_star(sql: &str) -> bool {
    SELECT_STAR.is_match(sql)
}

pub fn has_into_outfile(sql_upper: &str) -> bool {
    sql_upper.contains("INTO OUTFILE") || sql_upper.contains("INTO DUMPFILE")
}

pub fn has_load_data(sql_upper: &str) -> bool {
    sql_upper.contains("LOAD DATA")
}

pub fn is_suspicious_func(sql_upper: &str) -> bool {
    SUSPICIOUS_FUNCS.iter().any(|f| sql_upper.contains(f))
}

pub fn is_risky_command(sql_upper: &str) -> bool {
    sql_upper.trim_start().starts_with("DROP ")
        || sql_upper.trim_start().starts_with("TRUNCATE ")
}

pub fn is_admin_command(sql_upper: &str, admin_keywords: &[String]) -> bool {
    admin_keywords
        .iter()
        .any(|k| sql_upper.contains(k.to_uppercase().as_str()))
}

pub fn is_privilege_change(sql_upper: &str) -> bool {
    let s = sql_upper.trim_start();
    s.starts_with("GRANT ")
        || s.starts_with("REVOKE ")
        || s.starts_with("CREATE USER")
        || s.starts_with("DROP USER")
        || s.starts_with("ALTER USER")
        || s.starts_with("SET PASSWORD")
}

pub fn is_write_prefix(sql_lower: &str) -> bool {
    let s = sql_lower.trim_start();
    WRITE_PREFIXES.iter().any(|p| s.starts_with(p))
}

pub fn is_ddl_prefix(sql_lower: &str) -> bool {
    let s = sql_lower.trim_start();
    DDL_PREFIXES.iter().any(|p| s.starts_with(p))
}

/// Whether any accessed table (or the statement's default schema) belongs to
/// a system schema.
pub fn touches_system_schema(database: &str, accessed_tables: &[String]) -> bool {
    if SYSTEM_SCHEMAS.contains(&database.to_lowercase().as_str()) {
        return true;
    }
    accessed_tables.iter().any(|t| {
        t.split('.')
            .next()
            .map(|schema| SYSTEM_SCHEMAS.contains(&schema.to_lowercase().as_str()))
            .unwrap_or(false)
    })
}

/// Half-open clock window check: `[start, end)`, wrapping midnight when
/// `start > end`.
pub fn in_clock_window(t: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    if start <= end {
        t >= start && t < end
    } else {
        t >= start || t < end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entropy_of_empty_is_zero() {
        assert_eq!(shannon_entropy(""), 0.0);
    }

    #[test]
    fn entropy_of_uniform_text_is_zero() {
        assert_eq!(shannon_entropy("aaaa"), 0.0);
    }

    #[test]
    fn entropy_of_two_equal_symbols_is_one_bit() {
        assert!((shannon_entropy("abab") - 1.0).abs() < 1e-12);
    }

    #[test]
    fn entropy_grows_with_alphabet() {
        let low = shannon_entropy("select id from t");
        let high = shannon_entropy("sELeCt/**/0x41424344,CHAR(113,98,122)--");
        assert!(high > low);
    }

    #[test]
    fn lexical_flags() {
        assert!(has_comment("SELECT 1 -- hi"));
        assert!(has_comment("SELECT /* x */ 1"));
        assert!(!has_comment("SELECT 1"));
        assert!(has_hex_literal("SELECT 0xDEADBEEF"));
        assert!(is_select_star("select * from t"));
        assert!(is_select_star("SELECT  *  FROM t"));
        assert!(!is_select_star("SELECT id FROM t"));
        assert!(has_into_outfile("SELECT * FROM t INTO OUTFILE '/tmp/x'"));
        assert!(has_load_data("LOAD DATA INFILE 'x' INTO TABLE t"));
        assert!(is_suspicious_func("SELECT SLEEP(5)"));
        assert!(is_risky_command("DROP TABLE orders"));
        assert!(is_risky_command("TRUNCATE TABLE orders"));
        assert!(!is_risky_command("SELECT 'drop table'"));
        assert!(is_privilege_change("GRANT ALL ON *.* TO 'x'@'%'"));
        assert!(is_privilege_change("ALTER USER 'x'@'%' IDENTIFIED BY 'y'"));
    }

    #[test]
    fn write_and_ddl_prefixes() {
        assert!(is_write_prefix("insert into t values (1)"));
        assert!(is_write_prefix("  update t set a = 1"));
        assert!(!is_write_prefix("select * from t"));
        assert!(is_ddl_prefix("create table t (a int)"));
        assert!(is_ddl_prefix("drop table t"));
        assert!(!is_ddl_prefix("delete from t"));
    }

    #[test]
    fn system_schema_detection() {
        assert!(touches_system_schema("mysql", &[]));
        assert!(touches_system_schema("shop", &["information_schema.tables".into()]));
        assert!(!touches_system_schema("shop", &["shop.orders".into()]));
    }

    #[test]
    fn clock_window_is_half_open() {
        let start = NaiveTime::from_hms_opt(23, 0, 0).unwrap();
        let end = NaiveTime::from_hms_opt(6, 0, 0).unwrap();
        // wrapping window
        assert!(in_clock_window(NaiveTime::from_hms_opt(23, 0, 0).unwrap(), start, end));
        assert!(in_clock_window(NaiveTime::from_hms_opt(3, 14, 0).unwrap(), start, end));
        assert!(!in_clock_window(NaiveTime::from_hms_opt(6, 0, 0).unwrap(), start, end));
        assert!(!in_clock_window(NaiveTime::from_hms_opt(12, 0, 0).unwrap(), start, end));
        // plain window
        let s = NaiveTime::from_hms_opt(8, 0, 0).unwrap();
        let e = NaiveTime::from_hms_opt(18, 0, 0).unwrap();
        assert!(in_clock_window(NaiveTime::from_hms_opt(8, 0, 0).unwrap(), s, e));
        assert!(!in_clock_window(NaiveTime::from_hms_opt(18, 0, 0).unwrap(), s, e));
    }
}
