use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::{
    Dataset,
    record::{ANONYMOUS_OWNER, OwnerRole, TAG_OWNER_PREFIX},
};
use crate::{error::Result, users::User};

fn role_matches(role: OwnerRole, wanted: Option<OwnerRole>) -> bool {
    wanted.is_none_or(|wanted| wanted == role)
}

impl Dataset {
    /// Re-read direct owners and resolve `tag:` owners to the users
    /// currently carrying the tag.
    pub async fn refresh_owners(&mut self) -> Result<()> {
        let owners: BTreeMap<String, OwnerRole> = self
            .ctx
            .store
            .dataset_owners(&self.record.key)
            .await?
            .into_iter()
            .collect();

        let tags: BTreeMap<String, OwnerRole> = owners
            .iter()
            .filter_map(|(name, role)| {
                name.strip_prefix(TAG_OWNER_PREFIX)
                    .map(|tag| (tag.to_string(), *role))
            })
            .collect();

        let mut tagged_owners = BTreeMap::new();
        if !tags.is_empty() {
            let tag_names: Vec<String> = tags.keys().cloned().collect();
            for user in self.ctx.store.users_with_tags(&tag_names).await? {
                for (tag, role) in &tags {
                    if !user.has_tag(tag) {
                        continue;
                    }
                    let entry = tagged_owners.entry(user.name.clone()).or_insert(*role);
                    if *role == OwnerRole::Owner {
                        *entry = OwnerRole::Owner;
                    }
                }
            }
        }

        self.owners = owners;
        self.tagged_owners = tagged_owners;
        Ok(())
    }

    /// Grant `name` a role on this dataset and every descendant. Granting an
    /// existing owner changes its role.
    pub async fn add_owner(&mut self, name: &str, role: OwnerRole) -> Result<()> {
        let mut keys = vec![self.record.key.clone()];
        keys.extend(self.descendant_records().await?.into_iter().map(|r| r.key));

        for key in &keys {
            self.ctx.store.upsert_owner(key, name, role).await?;
        }
        debug!(dataset = %self.record.key, owner = name, %role, datasets = keys.len(), "owner added");
        self.refresh_owners().await
    }

    /// Revoke `name` on this dataset and every descendant. A dataset left
    /// without owners is handed to `anonymous`.
    pub async fn remove_owner(&mut self, name: &str) -> Result<()> {
        let mut keys = vec![self.record.key.clone()];
        keys.extend(self.descendant_records().await?.into_iter().map(|r| r.key));

        for key in &keys {
            self.ctx.store.remove_owner(key, name).await?;
            if self.ctx.store.dataset_owners(key).await?.is_empty() {
                self.ctx
                    .store
                    .upsert_owner(key, ANONYMOUS_OWNER, OwnerRole::Owner)
                    .await?;
            }
        }
        debug!(dataset = %self.record.key, owner = name, datasets = keys.len(), "owner removed");
        self.refresh_owners().await
    }

    /// Direct owner names with `role` (any role when `None`), `tag:`
    /// entries included.
    pub fn get_owners(&self, role: Option<OwnerRole>) -> Vec<String> {
        self.owners
            .iter()
            .filter(|(_, owner_role)| role_matches(**owner_role, role))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Usernames with `role`, with `tag:` entries expanded to their users.
    pub fn get_owners_users(&self, role: Option<OwnerRole>) -> Vec<String> {
        let direct = self
            .owners
            .iter()
            .filter(|(name, _)| !name.starts_with(TAG_OWNER_PREFIX));
        let users: BTreeSet<String> = direct
            .chain(self.tagged_owners.iter())
            .filter(|(_, owner_role)| role_matches(**owner_role, role))
            .map(|(name, _)| name.clone())
            .collect();
        users.into_iter().collect()
    }

    /// Admins can access everything; others need a direct or tag-derived
    /// ownership entry with `role` (any role when `None`).
    pub fn is_accessible_by(&self, user: &User, role: Option<OwnerRole>) -> bool {
        if user.is_admin {
            return true;
        }
        let direct = self
            .owners
            .get(&user.name)
            .is_some_and(|owner_role| role_matches(*owner_role, role));
        let tagged = self
            .tagged_owners
            .get(&user.name)
            .is_some_and(|owner_role| role_matches(*owner_role, role));
        direct || tagged
    }
}
