//! `provisioning_profiles` and `recipes` tables: reusable templates
//! referenced by id instead of repeating a full spec on every `POST /zones`.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use shared::zone::{ProvisioningProfile, ProvisioningSpec, Recipe};

use crate::store::migration::{Migration, SqlMigration};

pub fn migrations() -> Vec<Box<dyn Migration>> {
    vec![Box::new(SqlMigration {
        id: "provisioning_0001_create",
        sql: "
            CREATE TABLE IF NOT EXISTS provisioning_profiles (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                spec TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS recipes (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                script TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
        ",
    })]
}

fn row_to_profile(row: &Row<'_>) -> rusqlite::Result<ProvisioningProfile> {
    let spec_json: String = row.get("spec")?;
    Ok(ProvisioningProfile {
        id: row.get("id")?,
        name: row.get("name")?,
        spec: serde_json::from_str(&spec_json)
            .map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_recipe(row: &Row<'_>) -> rusqlite::Result<Recipe> {
    Ok(Recipe {
        id: row.get("id")?,
        name: row.get("name")?,
        script: row.get("script")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

pub fn upsert_profile(
    conn: &Connection,
    id: &str,
    name: &str,
    spec: &ProvisioningSpec,
    now: i64,
) -> Result<()> {
    let spec_json = serde_json::to_string(spec).context("serializing provisioning spec")?;
    conn.execute(
        "INSERT INTO provisioning_profiles (id, name, spec, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, spec = excluded.spec, updated_at = excluded.updated_at",
        params![id, name, spec_json, now],
    )
    .context("upserting provisioning profile")?;
    Ok(())
}

pub fn get_profile(conn: &Connection, id: &str) -> Result<Option<ProvisioningProfile>> {
    conn.query_row(
        "SELECT * FROM provisioning_profiles WHERE id = ?1",
        params![id],
        row_to_profile,
    )
    .optional()
    .context("fetching provisioning profile")
}

pub fn list_profiles(conn: &Connection) -> Result<Vec<ProvisioningProfile>> {
    let mut stmt = conn.prepare("SELECT * FROM provisioning_profiles ORDER BY name ASC")?;
    let rows = stmt
        .query_map([], row_to_profile)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn delete_profile(conn: &Connection, id: &str) -> Result<()> {
    conn.execute("DELETE FROM provisioning_profiles WHERE id = ?1", params![id])?;
    Ok(())
}

pub fn get_recipe(conn: &Connection, id: &str) -> Result<Option<Recipe>> {
    conn.query_row("SELECT * FROM recipes WHERE id = ?1", params![id], row_to_recipe)
        .optional()
        .context("fetching recipe")
}

pub fn list_recipes(conn: &Connection) -> Result<Vec<Recipe>> {
    let mut stmt = conn.prepare("SELECT * FROM recipes ORDER BY name ASC")?;
    let rows = stmt
        .query_map([], row_to_recipe)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn upsert_recipe(conn: &Connection, id: &str, name: &str, script: &str, now: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO recipes (id, name, script, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, script = excluded.script, updated_at = excluded.updated_at",
        params![id, name, script, now],
    )
    .context("upserting recipe")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::migration::MigrationRunner;

    fn test_conn() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        let mut runner = MigrationRunner::new();
        for m in migrations() {
            runner = runner.register(m);
        }
        runner.run(&mut conn).unwrap();
        conn
    }

    #[test]
    fn profile_round_trips() {
        let conn = test_conn();
        let spec = ProvisioningSpec {
            artifact_id: Some("art-1".into()),
            ..Default::default()
        };
        upsert_profile(&conn, "profile-1", "default", &spec, 1000).unwrap();
        let profile = get_profile(&conn, "profile-1").unwrap().unwrap();
        assert_eq!(profile.spec.artifact_id.as_deref(), Some("art-1"));
    }

    #[test]
    fn recipe_round_trips() {
        let conn = test_conn();
        upsert_recipe(&conn, "recipe-1", "bootstrap", "#!/bin/sh\necho hi", 1000).unwrap();
        let recipe = get_recipe(&conn, "recipe-1").unwrap().unwrap();
        assert_eq!(recipe.script, "#!/bin/sh\necho hi");
    }

    #[test]
    fn list_profiles_orders_by_name() {
        let conn = test_conn();
        upsert_profile(&conn, "b", "zzz", &ProvisioningSpec::default(), 1000).unwrap();
        upsert_profile(&conn, "a", "aaa", &ProvisioningSpec::default(), 1000).unwrap();
        let names: Vec<_> = list_profiles(&conn).unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["aaa", "zzz"]);
    }
}
