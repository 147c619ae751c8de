use crate::bridge::Bridge;
use crate::engine::Engine;
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{
    AddMember, Confirm, CreateGroup, Forgot, ForgotCheck, ForgotConfirm, GetGroups, GetNumLocation,
    GetStatus, Group, LeaveGroup, Login, Logout, Register, RemoveMember, Search, SendGroupStatus,
    SendLocation, Status, UpdateGroup, UserOut, Uuid,
};
use crate::time::now_ms;
use std::sync::Arc;
use tokio::sync::watch;

/// Last-known client state. Replaced as a whole on every change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientState {
    pub status: Option<Status>,
    pub groups: Vec<Group>,
    /// Always names an entry of `groups`, or is unset.
    pub active_group: Option<Uuid>,
}

impl ClientState {
    pub fn group(&self, uuid: Uuid) -> Option<&Group> {
        self.groups.iter().find(|g| g.uuid == uuid)
    }

    pub fn active(&self) -> Option<&Group> {
        self.active_group.and_then(|uuid| self.group(uuid))
    }

    pub fn is_authenticated(&self) -> bool {
        self.status.as_ref().is_some_and(Status::is_authenticated)
    }

    /// Install a fresh group list and re-point the active group at it.
    fn replace_groups(&mut self, groups: Vec<Group>) {
        let still_present = self
            .active_group
            .is_some_and(|uuid| groups.iter().any(|g| g.uuid == uuid));
        if !still_present {
            self.active_group = groups.first().map(|g| g.uuid);
        }
        self.groups = groups;
    }

    /// Drop a group the account no longer belongs to, repairing the
    /// selection like a refresh would.
    fn forget_group(&mut self, uuid: Uuid) {
        let groups = std::mem::take(&mut self.groups)
            .into_iter()
            .filter(|g| g.uuid != uuid)
            .collect();
        self.replace_groups(groups);
    }

    /// Drop `user` from a cached group. Removing the signed-in account
    /// drops the whole group.
    fn forget_member(&mut self, group_uuid: Uuid, user_uuid: Uuid) {
        let me = self
            .status
            .as_ref()
            .and_then(|s| s.account_data.as_ref())
            .map(|a| a.user_uuid);
        if me == Some(user_uuid) {
            self.forget_group(group_uuid);
        } else if let Some(group) = self.groups.iter_mut().find(|g| g.uuid == group_uuid) {
            group.members.remove(&user_uuid);
        }
    }

    fn sign_out(&mut self) {
        if let Some(status) = self.status.as_mut() {
            status.account_data = None;
        }
        self.groups.clear();
        self.active_group = None;
    }
}

/// Cache of status, groups and the active group, kept in step with the
/// engine.
///
/// Each operation issues its engine call first and touches the cache only
/// after a decoded success; on any error the cache is left as it was and the
/// error is returned. Observers get every new state through [`subscribe`].
///
/// [`subscribe`]: ClientStore::subscribe
pub struct ClientStore<E> {
    bridge: Arc<Bridge<E>>,
    state: watch::Sender<ClientState>,
}

impl<E: Engine> ClientStore<E> {
    pub fn new(bridge: Arc<Bridge<E>>) -> Self {
        let (state, _) = watch::channel(ClientState::default());
        Self { bridge, state }
    }

    pub fn bridge(&self) -> &Arc<Bridge<E>> {
        &self.bridge
    }

    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> ClientState {
        self.state.borrow().clone()
    }

    pub fn active_group(&self) -> Option<Uuid> {
        self.state.borrow().active_group
    }

    // -- Status and account --

    pub async fn refresh_status(&self) -> BridgeResult<Status> {
        let status = self.bridge.request(&GetStatus {}).await?;
        self.state.send_modify(|s| s.status = Some(status.clone()));
        Ok(status)
    }

    pub async fn register(
        &self,
        username: &str,
        password: &str,
        name: &str,
        email: &str,
    ) -> BridgeResult<()> {
        self.bridge
            .request(&Register {
                username: username.to_string(),
                password: password.to_string(),
                name: name.to_string(),
                email: email.to_string(),
            })
            .await
    }

    /// Sign in, then reload status and groups for the new account.
    pub async fn login(&self, username_or_email: &str, password: &str) -> BridgeResult<Uuid> {
        let user_uuid = self
            .bridge
            .request(&Login {
                username_or_email: username_or_email.to_string(),
                password: password.to_string(),
            })
            .await?;
        tracing::info!(%user_uuid, "signed in");
        self.reload_account().await?;
        Ok(user_uuid)
    }

    /// Confirm a registration token. Signs the user in like [`login`].
    ///
    /// [`login`]: ClientStore::login
    pub async fn confirm(&self, token: Uuid) -> BridgeResult<Uuid> {
        let user_uuid = self.bridge.request(&Confirm { token }).await?;
        tracing::info!(%user_uuid, "registration confirmed");
        self.reload_account().await?;
        Ok(user_uuid)
    }

    /// Sign out. Account data and groups are dropped together; the status
    /// is then re-read if the engine answers. The engine session itself
    /// stays valid.
    pub async fn logout(&self) -> BridgeResult<()> {
        self.bridge.request(&Logout {}).await?;
        self.state.send_modify(ClientState::sign_out);
        tracing::info!("signed out");
        if let Err(err) = self.refresh_status().await {
            tracing::warn!(%err, "status refresh after sign-out failed");
        }
        Ok(())
    }

    pub async fn forgot(&self, email: &str) -> BridgeResult<()> {
        self.bridge
            .request(&Forgot {
                email: email.to_string(),
            })
            .await
    }

    pub async fn forgot_check(&self, token: Uuid) -> BridgeResult<bool> {
        self.bridge.request(&ForgotCheck { token }).await
    }

    pub async fn forgot_confirm(&self, password: &str, token: Uuid) -> BridgeResult<()> {
        self.bridge
            .request(&ForgotConfirm {
                password: password.to_string(),
                token,
            })
            .await
    }

    pub async fn search(&self, query: &str) -> BridgeResult<Vec<UserOut>> {
        self.bridge
            .request(&Search {
                query: query.to_string(),
            })
            .await
    }

    async fn reload_account(&self) -> BridgeResult<()> {
        self.refresh_status().await?;
        self.refresh_groups().await?;
        Ok(())
    }

    // -- Groups --

    /// Reload the group list. If the active group is gone (or was unset) it
    /// moves to the first group, or is cleared when there are none.
    pub async fn refresh_groups(&self) -> BridgeResult<Vec<Group>> {
        let groups = self.bridge.request(&GetGroups {}).await?;
        self.state.send_modify(|s| s.replace_groups(groups.clone()));
        tracing::debug!(count = groups.len(), "groups refreshed");
        Ok(groups)
    }

    /// Select the group shown and synced. `Some` must name a cached group.
    pub fn set_active_group(&self, uuid: Option<Uuid>) -> BridgeResult<()> {
        let mut outcome = Ok(());
        self.state.send_if_modified(|s| match uuid {
            Some(uuid) if s.group(uuid).is_none() => {
                outcome = Err(BridgeError::UnknownGroup { uuid });
                false
            }
            _ if s.active_group == uuid => false,
            _ => {
                s.active_group = uuid;
                true
            }
        });
        outcome
    }

    /// Create a group, name it if `name` is given, reload the list and make
    /// the new group active.
    pub async fn create_group(&self, name: Option<&str>) -> BridgeResult<Uuid> {
        let uuid = self.bridge.request(&CreateGroup {}).await?;
        tracing::info!(group = %uuid, "group created");
        if let Some(name) = name {
            self.bridge
                .request(&UpdateGroup {
                    group_uuid: uuid,
                    name: Some(name.to_string()),
                })
                .await?;
        }
        self.refresh_groups().await?;
        self.state.send_if_modified(|s| {
            let select = s.group(uuid).is_some() && s.active_group != Some(uuid);
            if select {
                s.active_group = Some(uuid);
            }
            select
        });
        Ok(uuid)
    }

    pub async fn update_group(&self, uuid: Uuid, name: Option<&str>) -> BridgeResult<()> {
        let name = name.map(str::to_string);
        self.bridge
            .request(&UpdateGroup {
                group_uuid: uuid,
                name: name.clone(),
            })
            .await?;
        self.state.send_if_modified(|s| {
            match s.groups.iter_mut().find(|g| g.uuid == uuid) {
                Some(group) if group.name != name => {
                    group.name = name;
                    true
                }
                _ => false,
            }
        });
        Ok(())
    }

    /// Leave a group. Completes only after the group list has been reloaded.
    /// If that reload fails the group is still dropped from the cache before
    /// the error is returned.
    pub async fn leave_group(&self, uuid: Uuid) -> BridgeResult<()> {
        self.bridge.request(&LeaveGroup { group_uuid: uuid }).await?;
        tracing::info!(group = %uuid, "left group");
        if let Err(err) = self.refresh_groups().await {
            self.state.send_modify(|s| s.forget_group(uuid));
            return Err(err);
        }
        Ok(())
    }

    pub async fn add_member(&self, group_uuid: Uuid, user_uuid: Uuid) -> BridgeResult<()> {
        self.bridge
            .request(&AddMember {
                group_uuid,
                user_uuid,
            })
            .await?;
        self.refresh_groups().await?;
        Ok(())
    }

    pub async fn remove_member(&self, group_uuid: Uuid, user_uuid: Uuid) -> BridgeResult<()> {
        self.bridge
            .request(&RemoveMember {
                group_uuid,
                user_uuid,
            })
            .await?;
        if let Err(err) = self.refresh_groups().await {
            self.state
                .send_modify(|s| s.forget_member(group_uuid, user_uuid));
            return Err(err);
        }
        Ok(())
    }

    /// Announce a membership change to the rest of the group. The cache is
    /// not touched.
    pub async fn send_group_status(&self, group_uuid: Uuid) -> BridgeResult<()> {
        self.bridge.request(&SendGroupStatus { group_uuid }).await
    }

    // -- Locations --

    /// Share this device's position with a group, stamped now.
    pub async fn send_location(
        &self,
        group_uuid: Uuid,
        latitude: f64,
        longitude: f64,
    ) -> BridgeResult<()> {
        self.bridge
            .request(&SendLocation {
                group_uuid,
                longitude,
                latitude,
                timestamp: now_ms(),
            })
            .await
    }

    /// Number of samples `client` shared with a group in `[from, to]` (ms).
    pub async fn location_count(
        &self,
        group_uuid: Uuid,
        client: Uuid,
        from_timestamp: i64,
        to_timestamp: i64,
    ) -> BridgeResult<i64> {
        self.bridge
            .request(&GetNumLocation {
                group_uuid,
                client,
                from_timestamp,
                to_timestamp,
            })
            .await
    }
}
