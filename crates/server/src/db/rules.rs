use chrono::{DateTime, Utc};
use pipeline::rules::{ExtractPattern, FieldMapping, ParsingRule};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

use super::{now_str, parse_ts, Database, StoreError, StoreResult};

#[derive(Debug, Clone, Serialize)]
pub struct RuleRecord {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub description: String,
    pub active: bool,
    pub field_mappings: Vec<FieldMapping>,
    pub extract_patterns: Vec<ExtractPattern>,
    pub is_template: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RuleRecord {
    /// View as the pipeline's rule type for compilation.
    pub fn as_parsing_rule(&self) -> ParsingRule {
        ParsingRule {
            name: self.name.clone(),
            description: self.description.clone(),
            active: self.active,
            field_mappings: self.field_mappings.clone(),
            extract_patterns: self.extract_patterns.clone(),
            is_template: self.is_template,
        }
    }
}

const RULE_COLUMNS: &str = "id, user_id, name, description, active, field_mappings, \
                            extract_patterns, is_template, created_at, updated_at";

fn map_rule(row: &rusqlite::Row<'_>) -> rusqlite::Result<RuleRecord> {
    let mappings: String = row.get(5)?;
    let patterns: String = row.get(6)?;
    Ok(RuleRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        active: row.get(4)?,
        field_mappings: serde_json::from_str(&mappings).unwrap_or_default(),
        extract_patterns: serde_json::from_str(&patterns).unwrap_or_default(),
        is_template: row.get(7)?,
        created_at: parse_ts(&row.get::<_, String>(8)?),
        updated_at: parse_ts(&row.get::<_, String>(9)?),
    })
}

impl Database {
    pub fn insert_rule(&self, user_id: &str, rule: &ParsingRule) -> StoreResult<RuleRecord> {
        let id = Uuid::new_v4().to_string();
        let mappings = serde_json::to_string(&rule.field_mappings)?;
        let patterns = serde_json::to_string(&rule.extract_patterns)?;
        let now = now_str();
        self.with(|conn| {
            conn.execute(
                "INSERT INTO parsing_rules
                     (id, user_id, name, description, active, field_mappings, extract_patterns,
                      is_template, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    id,
                    user_id,
                    rule.name,
                    rule.description,
                    rule.active,
                    mappings,
                    patterns,
                    rule.is_template,
                    now
                ],
            )?;
            Ok(())
        })?;
        self.rule_by_id(&id)
    }

    pub fn update_rule(&self, id: &str, rule: &ParsingRule) -> StoreResult<RuleRecord> {
        let mappings = serde_json::to_string(&rule.field_mappings)?;
        let patterns = serde_json::to_string(&rule.extract_patterns)?;
        self.with(|conn| {
            let changed = conn.execute(
                "UPDATE parsing_rules
                 SET name = ?2, description = ?3, active = ?4, field_mappings = ?5,
                     extract_patterns = ?6, is_template = ?7, updated_at = ?8
                 WHERE id = ?1",
                params![
                    id,
                    rule.name,
                    rule.description,
                    rule.active,
                    mappings,
                    patterns,
                    rule.is_template,
                    now_str()
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })?;
        self.rule_by_id(id)
    }

    pub fn rule_by_id(&self, id: &str) -> StoreResult<RuleRecord> {
        self.with(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM parsing_rules WHERE id = ?1", RULE_COLUMNS),
                params![id],
                map_rule,
            )
            .optional()?
            .ok_or(StoreError::NotFound)
        })
    }

    pub fn rules_for_user(&self, user_id: &str) -> StoreResult<Vec<RuleRecord>> {
        self.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM parsing_rules WHERE user_id = ?1 ORDER BY created_at ASC",
                RULE_COLUMNS
            ))?;
            let rules = stmt
                .query_map(params![user_id], map_rule)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rules)
        })
    }

    /// The rule set the parser consults for this owner.
    pub fn active_rules_for_user(&self, user_id: &str) -> StoreResult<Vec<ParsingRule>> {
        Ok(self
            .rules_for_user(user_id)?
            .into_iter()
            .filter(|r| r.active)
            .map(|r| r.as_parsing_rule())
            .collect())
    }

    pub fn delete_rule(&self, id: &str) -> StoreResult<()> {
        self.with(|conn| {
            let changed = conn.execute("DELETE FROM parsing_rules WHERE id = ?1", params![id])?;
            if changed == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
    }
}
