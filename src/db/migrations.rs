use anyhow::{bail, Context, Result};
use rusqlite::{Connection, Transaction};

/// Ordered list of migration scripts for one database file. Version N runs `steps[N - 1]`.
pub struct Schema {
    pub name: &'static str,
    pub steps: &'static [&'static str],
}

impl Schema {
    pub fn current_version(&self) -> i32 {
        self.steps.len() as i32
    }
}

pub static BUFFER_SCHEMA: Schema = Schema {
    name: "buffer",
    steps: &[include_str!("schemas/buffer_v1.sql")],
};

pub static INDEX_SCHEMA: Schema = Schema {
    name: "index",
    steps: &[include_str!("schemas/index_v1.sql")],
};

pub fn run_migrations(conn: &mut Connection, schema: &Schema) -> Result<()> {
    let target = schema.current_version();
    let mut version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .context("failed to read user_version pragma")?;

    if version > target {
        bail!(
            "{} database version ({}) is newer than supported schema ({})",
            schema.name,
            version,
            target
        );
    }

    if version == target {
        return Ok(());
    }

    let tx = conn
        .transaction()
        .context("failed to open migration transaction")?;

    while version < target {
        let next_version = version + 1;
        apply_migration(&tx, schema, next_version)
            .with_context(|| format!("migration to version {next_version} failed"))?;
        version = next_version;
    }

    tx.pragma_update(None, "user_version", target)
        .context("failed to update user_version pragma")?;
    tx.commit().context("failed to commit migrations")?;

    Ok(())
}

fn apply_migration(tx: &Transaction<'_>, schema: &Schema, version: i32) -> Result<()> {
    let Some(script) = usize::try_from(version - 1)
        .ok()
        .and_then(|idx| schema.steps.get(idx))
    else {
        bail!("unknown {} migration target version: {version}", schema.name);
    };

    tx.execute_batch(script)
        .with_context(|| format!("failed to execute {} schema v{version}", schema.name))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn, &BUFFER_SCHEMA).unwrap();
        run_migrations(&mut conn, &BUFFER_SCHEMA).unwrap();

        let version: i32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, BUFFER_SCHEMA.current_version());
    }

    #[test]
    fn newer_database_is_rejected() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", 99).unwrap();
        assert!(run_migrations(&mut conn, &INDEX_SCHEMA).is_err());
    }
}
