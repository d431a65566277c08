//! SQLite-backed story graph storage

use async_trait::async_trait;
use loom_common::db::{BranchCanon, CanonCharacter, CharacterReference, CreatorProfile, StoryNode};
use loom_common::{Error, Result};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use uuid::Uuid;

use super::{parse_json_list, parse_uuid, to_json};
use crate::store::GraphStore;

#[derive(Debug, Clone)]
pub struct SqliteGraphStore {
    pool: SqlitePool,
}

impl SqliteGraphStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert or replace a node (graph editing lives elsewhere; used for seeding)
    pub async fn insert_node(&self, node: &StoryNode) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO nodes (
                node_id, timeline_id, parent_id, branch_id, title, content, label, image_url, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(node.node_id.to_string())
        .bind(node.timeline_id.to_string())
        .bind(node.parent_id.map(|id| id.to_string()))
        .bind(node.branch_id.map(|id| id.to_string()))
        .bind(&node.title)
        .bind(&node.content)
        .bind(&node.label)
        .bind(&node.image_url)
        .bind(loom_common::time::to_db_timestamp(loom_common::time::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_branch_canon(&self, canon: &BranchCanon) -> Result<()> {
        let characters = to_json(&canon.characters, "characters")?;
        let rules = to_json(&canon.rules, "rules")?;

        sqlx::query(
            r#"
            INSERT INTO branch_canon (branch_id, setting, characters, tone, rules, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(branch_id) DO UPDATE SET
                setting = excluded.setting,
                characters = excluded.characters,
                tone = excluded.tone,
                rules = excluded.rules,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(canon.branch_id.to_string())
        .bind(&canon.setting)
        .bind(characters)
        .bind(&canon.tone)
        .bind(rules)
        .bind(loom_common::time::to_db_timestamp(loom_common::time::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_creator_profile(&self, user_id: &str, profile: &CreatorProfile) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO creator_profiles (
                user_id, preferred_genres, writing_style, favorite_themes,
                disliked_elements, exploration_ratio, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                preferred_genres = excluded.preferred_genres,
                writing_style = excluded.writing_style,
                favorite_themes = excluded.favorite_themes,
                disliked_elements = excluded.disliked_elements,
                exploration_ratio = excluded.exploration_ratio,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(to_json(&profile.preferred_genres, "preferred_genres")?)
        .bind(&profile.writing_style)
        .bind(to_json(&profile.favorite_themes, "favorite_themes")?)
        .bind(to_json(&profile.disliked_elements, "disliked_elements")?)
        .bind(profile.exploration_ratio)
        .bind(loom_common::time::to_db_timestamp(loom_common::time::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_character_reference(&self, reference: &CharacterReference) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO character_references (timeline_id, name, identity_block, portrait_url)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(timeline_id, name) DO UPDATE SET
                identity_block = excluded.identity_block,
                portrait_url = excluded.portrait_url
            "#,
        )
        .bind(reference.timeline_id.to_string())
        .bind(&reference.name)
        .bind(&reference.identity_block)
        .bind(&reference.portrait_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn node_from_row(row: &SqliteRow) -> Result<StoryNode> {
    let node_id: String = row.get("node_id");
    let timeline_id: String = row.get("timeline_id");
    let parent_id: Option<String> = row.get("parent_id");
    let branch_id: Option<String> = row.get("branch_id");

    Ok(StoryNode {
        node_id: parse_uuid(&node_id, "node_id")?,
        timeline_id: parse_uuid(&timeline_id, "timeline_id")?,
        parent_id: parent_id
            .as_deref()
            .map(|id| parse_uuid(id, "parent_id"))
            .transpose()?,
        branch_id: branch_id
            .as_deref()
            .map(|id| parse_uuid(id, "branch_id"))
            .transpose()?,
        title: row.get("title"),
        content: row.get("content"),
        label: row.get("label"),
        image_url: row.get("image_url"),
    })
}

#[async_trait]
impl GraphStore for SqliteGraphStore {
    async fn get_node(&self, timeline_id: Uuid, node_id: Uuid) -> Result<Option<StoryNode>> {
        let row = sqlx::query(
            r#"
            SELECT node_id, timeline_id, parent_id, branch_id, title, content, label, image_url
            FROM nodes
            WHERE node_id = ? AND timeline_id = ?
            "#,
        )
        .bind(node_id.to_string())
        .bind(timeline_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(node_from_row).transpose()
    }

    async fn get_ancestry(&self, node_id: Uuid, max_depth: usize) -> Result<Vec<StoryNode>> {
        // UNION ALL plus the depth bound terminates even when parent links form a cycle
        let rows = sqlx::query(
            r#"
            WITH RECURSIVE chain(node_id, parent_id, depth) AS (
                SELECT node_id, parent_id, 0 FROM nodes WHERE node_id = ?
                UNION ALL
                SELECT n.node_id, n.parent_id, c.depth + 1
                FROM nodes n
                JOIN chain c ON n.node_id = c.parent_id
                WHERE c.depth < ?
            )
            SELECT n.node_id, n.timeline_id, n.parent_id, n.branch_id,
                   n.title, n.content, n.label, n.image_url
            FROM chain c
            JOIN nodes n ON n.node_id = c.node_id
            WHERE c.depth > 0
            ORDER BY c.depth ASC
            "#,
        )
        .bind(node_id.to_string())
        .bind(max_depth as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(node_from_row).collect()
    }

    async fn set_node_image(&self, node_id: Uuid, image_url: &str) -> Result<()> {
        let result = sqlx::query("UPDATE nodes SET image_url = ? WHERE node_id = ?")
            .bind(image_url)
            .bind(node_id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("Node not found: {}", node_id)));
        }
        Ok(())
    }

    async fn get_branch_canon(&self, branch_id: Uuid) -> Result<Option<BranchCanon>> {
        let row = sqlx::query(
            "SELECT setting, characters, tone, rules FROM branch_canon WHERE branch_id = ?",
        )
        .bind(branch_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let characters: String = row.get("characters");
                let characters: Vec<CanonCharacter> = serde_json::from_str(&characters)
                    .map_err(|e| Error::Internal(format!("Failed to deserialize characters: {}", e)))?;
                let rules: String = row.get("rules");

                Ok(Some(BranchCanon {
                    branch_id,
                    setting: row.get("setting"),
                    characters,
                    tone: row.get("tone"),
                    rules: parse_json_list(&rules, "rules")?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn get_creator_profile(&self, user_id: &str) -> Result<Option<CreatorProfile>> {
        let row = sqlx::query(
            r#"
            SELECT preferred_genres, writing_style, favorite_themes, disliked_elements, exploration_ratio
            FROM creator_profiles
            WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let genres: String = row.get("preferred_genres");
                let themes: String = row.get("favorite_themes");
                let disliked: String = row.get("disliked_elements");

                Ok(Some(CreatorProfile {
                    preferred_genres: parse_json_list(&genres, "preferred_genres")?,
                    writing_style: row.get("writing_style"),
                    favorite_themes: parse_json_list(&themes, "favorite_themes")?,
                    disliked_elements: parse_json_list(&disliked, "disliked_elements")?,
                    exploration_ratio: row.get("exploration_ratio"),
                }))
            }
            None => Ok(None),
        }
    }

    async fn get_character_references(&self, timeline_id: Uuid) -> Result<Vec<CharacterReference>> {
        let rows = sqlx::query(
            r#"
            SELECT name, identity_block, portrait_url
            FROM character_references
            WHERE timeline_id = ?
            ORDER BY name
            "#,
        )
        .bind(timeline_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| CharacterReference {
                timeline_id,
                name: row.get("name"),
                identity_block: row.get("identity_block"),
                portrait_url: row.get("portrait_url"),
            })
            .collect())
    }

    async fn set_character_portrait(
        &self,
        timeline_id: Uuid,
        name: &str,
        portrait_url: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE character_references SET portrait_url = ? WHERE timeline_id = ? AND name = ?",
        )
        .bind(portrait_url)
        .bind(timeline_id.to_string())
        .bind(name)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_common::db::init_memory_database;

    fn node(timeline_id: Uuid, parent_id: Option<Uuid>, title: &str) -> StoryNode {
        StoryNode {
            node_id: Uuid::new_v4(),
            timeline_id,
            parent_id,
            branch_id: None,
            title: title.to_string(),
            content: format!("{} content", title),
            label: None,
            image_url: None,
        }
    }

    #[tokio::test]
    async fn test_ancestry_nearest_first() {
        let store = SqliteGraphStore::new(init_memory_database().await.unwrap());
        let timeline = Uuid::new_v4();
        let root = node(timeline, None, "root");
        let a = node(timeline, Some(root.node_id), "a");
        let b = node(timeline, Some(a.node_id), "b");
        for n in [&root, &a, &b] {
            store.insert_node(n).await.unwrap();
        }

        let chain = store.get_ancestry(b.node_id, 200).await.unwrap();
        let titles: Vec<&str> = chain.iter().map(|n| n.title.as_str()).collect();
        assert_eq!(titles, vec!["a", "root"]);
    }

    #[tokio::test]
    async fn test_ancestry_bounded_on_cycle() {
        let store = SqliteGraphStore::new(init_memory_database().await.unwrap());
        let timeline = Uuid::new_v4();
        let mut a = node(timeline, None, "a");
        let b = node(timeline, Some(a.node_id), "b");
        a.parent_id = Some(b.node_id);
        store.insert_node(&a).await.unwrap();
        store.insert_node(&b).await.unwrap();

        let chain = store.get_ancestry(b.node_id, 10).await.unwrap();
        assert_eq!(chain.len(), 10);
    }

    #[tokio::test]
    async fn test_get_node_scoped_to_timeline() {
        let store = SqliteGraphStore::new(init_memory_database().await.unwrap());
        let n = node(Uuid::new_v4(), None, "root");
        store.insert_node(&n).await.unwrap();

        assert!(store.get_node(n.timeline_id, n.node_id).await.unwrap().is_some());
        assert!(store.get_node(Uuid::new_v4(), n.node_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_node_image_missing_node() {
        let store = SqliteGraphStore::new(init_memory_database().await.unwrap());
        let result = store.set_node_image(Uuid::new_v4(), "/media/x.png").await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_canon_and_profile_roundtrip() {
        let store = SqliteGraphStore::new(init_memory_database().await.unwrap());
        let canon = BranchCanon {
            branch_id: Uuid::new_v4(),
            setting: "A lighthouse colony".to_string(),
            characters: vec![CanonCharacter {
                name: "Mira".to_string(),
                description: "Keeper of the lamp".to_string(),
            }],
            tone: "wistful".to_string(),
            rules: vec!["The lamp never goes dark".to_string()],
        };
        store.upsert_branch_canon(&canon).await.unwrap();
        assert_eq!(store.get_branch_canon(canon.branch_id).await.unwrap(), Some(canon));

        let profile = CreatorProfile {
            preferred_genres: vec!["mystery".to_string()],
            writing_style: "spare".to_string(),
            favorite_themes: vec![],
            disliked_elements: vec!["gore".to_string()],
            exploration_ratio: 0.4,
        };
        store.upsert_creator_profile("user-1", &profile).await.unwrap();
        assert_eq!(store.get_creator_profile("user-1").await.unwrap(), Some(profile));
        assert_eq!(store.get_creator_profile("user-2").await.unwrap(), None);
    }
}
