//! In-process engine that speaks the real JSON wire format.
//!
//! Keeps accounts, groups and location samples in memory, records every call
//! and lets tests hold replies behind gates or inject faults per method.

use bubble::DEFAULT_DOMAIN;
use bubble::engine::Engine;
use bubble::error::TransportError;
use bubble::protocol::{
    AccountData, AddMember, Confirm, EngineError, Forgot, ForgotCheck, ForgotConfirm,
    GetLocation, GetNumLocation, Group, IncomingEnvelope, Init, LeaveGroup, LocationSample,
    Login, RemoveMember, Register, Search, SendGroupStatus, SendLocation, SessionHandle, Status,
    UpdateGroup, UserGroupInfo, UserOut, Uuid, encode_reply,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;

/// One envelope as the engine received it.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub method: String,
    pub instance: Option<SessionHandle>,
    pub args: serde_json::Value,
    pub at: Instant,
}

/// An account created directly in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeededUser {
    pub uuid: Uuid,
    pub client: Uuid,
}

/// What to do instead of answering the next call to a method.
#[derive(Debug, Clone)]
pub enum Fault {
    /// The entry point fails.
    Transport(String),
    /// Reply with this raw text.
    Reply(String),
}

/// Holds calls to one method until released. Waiters pass in arrival order.
#[derive(Clone)]
pub struct Gate {
    permits: Arc<Semaphore>,
}

impl Gate {
    /// Let the next `n` held calls through.
    pub fn release(&self, n: usize) {
        self.permits.add_permits(n);
    }

    /// Let every held and future call through.
    pub fn open(&self) {
        self.permits.close();
    }

    async fn pass(&self) {
        if let Ok(permit) = self.permits.acquire().await {
            permit.forget();
        }
    }
}

struct Account {
    user: UserOut,
    client: Uuid,
    email: String,
    password: String,
}

#[derive(Default)]
struct World {
    data_dir: Option<String>,
    next_handle: u64,
    live: Vec<SessionHandle>,
    accounts: Vec<Account>,
    signed_in: Option<Uuid>,
    groups: Vec<Group>,
    samples: HashMap<(Uuid, Uuid), Vec<LocationSample>>,
    confirm_tokens: HashMap<Uuid, Uuid>,
    reset_tokens: HashMap<Uuid, Uuid>,
}

#[derive(Default)]
pub struct MemoryEngine {
    world: Mutex<World>,
    log: Mutex<Vec<CallRecord>>,
    replied: Mutex<HashMap<String, usize>>,
    gates: Mutex<HashMap<String, Gate>>,
    faults: Mutex<HashMap<String, VecDeque<Fault>>>,
    activity: Notify,
}

impl MemoryEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // -- Seeding --

    pub fn add_account(&self, username: &str, name: &str, password: &str) -> SeededUser {
        let mut world = self.world.lock().unwrap();
        world.create_account(username, name, &format!("{username}@example.com"), password)
    }

    /// A group containing `members`, created without going through the wire.
    pub fn seed_group(&self, name: &str, members: &[SeededUser]) -> Uuid {
        let mut world = self.world.lock().unwrap();
        let uuid = Uuid::new_v4();
        let members = members
            .iter()
            .filter_map(|m| world.group_info(m.uuid).map(|info| (m.uuid, info)))
            .collect();
        world.groups.push(Group {
            uuid,
            name: Some(name.to_string()),
            image: None,
            members,
        });
        uuid
    }

    pub fn seed_location(
        &self,
        group_uuid: Uuid,
        client: Uuid,
        latitude: f64,
        longitude: f64,
        timestamp: i64,
    ) {
        let mut world = self.world.lock().unwrap();
        world
            .samples
            .entry((group_uuid, client))
            .or_default()
            .push(LocationSample {
                latitude,
                longitude,
                timestamp,
            });
    }

    pub fn confirm_token_for(&self, user_uuid: Uuid) -> Option<Uuid> {
        let world = self.world.lock().unwrap();
        world
            .confirm_tokens
            .iter()
            .find(|(_, user)| **user == user_uuid)
            .map(|(token, _)| *token)
    }

    pub fn reset_token_for(&self, user_uuid: Uuid) -> Option<Uuid> {
        let world = self.world.lock().unwrap();
        world
            .reset_tokens
            .iter()
            .find(|(_, user)| **user == user_uuid)
            .map(|(token, _)| *token)
    }

    pub fn account_by_username(&self, username: &str) -> Option<SeededUser> {
        let world = self.world.lock().unwrap();
        world
            .accounts
            .iter()
            .find(|a| a.user.username == username)
            .map(|a| SeededUser {
                uuid: a.user.uuid,
                client: a.client,
            })
    }

    pub fn live_handles(&self) -> Vec<SessionHandle> {
        self.world.lock().unwrap().live.clone()
    }

    // -- Call log --

    pub fn log(&self) -> Vec<CallRecord> {
        self.log.lock().unwrap().clone()
    }

    pub fn total_calls(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    pub fn calls(&self, method: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.method == method)
            .count()
    }

    pub fn methods(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.method.clone())
            .collect()
    }

    /// Calls to `method` that have been answered (not still gated).
    pub fn replies(&self, method: &str) -> usize {
        self.replied.lock().unwrap().get(method).copied().unwrap_or(0)
    }

    /// Wait until at least `n` calls to `method` have arrived.
    pub async fn wait_for_calls(&self, method: &str, n: usize) {
        loop {
            let notified = self.activity.notified();
            if self.calls(method) >= n {
                return;
            }
            notified.await;
        }
    }

    /// Wait until at least `n` calls to `method` have been answered.
    pub async fn wait_for_replies(&self, method: &str, n: usize) {
        loop {
            let notified = self.activity.notified();
            if self.replies(method) >= n {
                return;
            }
            notified.await;
        }
    }

    // -- Control --

    pub fn hold(&self, method: &str) -> Gate {
        let gate = Gate {
            permits: Arc::new(Semaphore::new(0)),
        };
        self.gates
            .lock()
            .unwrap()
            .insert(method.to_string(), gate.clone());
        gate
    }

    /// Answer the next call to `method` with `fault`. Faults queue up.
    pub fn inject(&self, method: &str, fault: Fault) {
        self.faults
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default()
            .push_back(fault);
    }

    fn gate_for(&self, method: &str) -> Option<Gate> {
        self.gates.lock().unwrap().get(method).cloned()
    }

    fn take_fault(&self, method: &str) -> Option<Fault> {
        self.faults
            .lock()
            .unwrap()
            .get_mut(method)
            .and_then(VecDeque::pop_front)
    }

    fn answer(&self, incoming: &IncomingEnvelope) -> Result<String, TransportError> {
        if let Some(fault) = self.take_fault(&incoming.method) {
            return match fault {
                Fault::Transport(message) => Err(TransportError::new(message)),
                Fault::Reply(raw) => Ok(raw),
            };
        }
        self.world.lock().unwrap().dispatch(incoming)
    }
}

impl Engine for MemoryEngine {
    async fn call(&self, envelope: String) -> Result<String, TransportError> {
        let incoming: IncomingEnvelope = serde_json::from_str(&envelope)
            .map_err(|err| TransportError::new(format!("bad envelope: {err}")))?;
        self.log.lock().unwrap().push(CallRecord {
            method: incoming.method.clone(),
            instance: incoming.instance,
            args: incoming.args.clone(),
            at: Instant::now(),
        });
        self.activity.notify_waiters();

        if let Some(gate) = self.gate_for(&incoming.method) {
            gate.pass().await;
        }
        let reply = self.answer(&incoming);

        *self
            .replied
            .lock()
            .unwrap()
            .entry(incoming.method.clone())
            .or_default() += 1;
        self.activity.notify_waiters();
        reply
    }
}

fn args<T: DeserializeOwned>(incoming: &IncomingEnvelope) -> Result<T, TransportError> {
    serde_json::from_value(incoming.args.clone())
        .map_err(|err| TransportError::new(format!("bad args for {}: {err}", incoming.method)))
}

fn reply<T: Serialize, E: Serialize>(result: Result<T, E>) -> Result<String, TransportError> {
    Ok(encode_reply(&result))
}

fn fail(message: &str) -> EngineError {
    EngineError::new(message)
}

impl World {
    fn dispatch(&mut self, incoming: &IncomingEnvelope) -> Result<String, TransportError> {
        if incoming.method == "init" {
            let init: Init = args(incoming)?;
            return reply(self.init(init));
        }
        match incoming.instance {
            Some(handle) if self.live.contains(&handle) => {}
            other => return Err(TransportError::new(format!("unknown instance {other:?}"))),
        }
        match incoming.method.as_str() {
            "status" => reply::<_, ()>(Ok(self.status())),
            "register" => reply(self.register(args(incoming)?)),
            "login" => reply(self.login(args(incoming)?)),
            "logout" => reply(self.logout()),
            "forgot" => reply(self.forgot(args(incoming)?)),
            "confirm" => reply(self.confirm(args(incoming)?)),
            "forgot_check" => {
                let check: ForgotCheck = args(incoming)?;
                reply::<_, EngineError>(Ok(self.reset_tokens.contains_key(&check.token)))
            }
            "forgot_confirm" => reply(self.forgot_confirm(args(incoming)?)),
            "search" => reply(self.search(args(incoming)?)),
            "get_groups" => reply(self.get_groups()),
            "create_group" => reply(self.create_group()),
            "update_group" => reply(self.update_group(args(incoming)?)),
            "add_member" => reply(self.add_member(args(incoming)?)),
            "remove_member" => reply(self.remove_member(args(incoming)?)),
            "leave_group" => reply(self.leave_group(args(incoming)?)),
            "send_group_status" => reply(self.send_group_status(args(incoming)?)),
            "get_location" => reply(self.get_location(args(incoming)?)),
            "get_num_location" => reply(self.get_num_location(args(incoming)?)),
            "send_location" => reply(self.send_location(args(incoming)?)),
            "receive_messages" | "replace_key_packages" => reply::<_, EngineError>(Ok(())),
            other => Err(TransportError::new(format!("unknown method {other}"))),
        }
    }

    fn init(&mut self, init: Init) -> Result<SessionHandle, String> {
        if init.data_dir.is_empty() {
            return Err("dataDir is required".to_string());
        }
        self.next_handle += 1;
        let handle = SessionHandle(self.next_handle);
        self.data_dir = Some(init.data_dir);
        self.live.push(handle);
        Ok(handle)
    }

    fn status(&self) -> Status {
        Status {
            domain: DEFAULT_DOMAIN.to_string(),
            data_directory: self.data_dir.clone().unwrap_or_default(),
            account_data: self.signed_in.and_then(|uuid| {
                self.account(uuid).map(|a| AccountData {
                    user_uuid: uuid,
                    client_uuid: Some(a.client),
                })
            }),
        }
    }

    fn create_account(
        &mut self,
        username: &str,
        name: &str,
        email: &str,
        password: &str,
    ) -> SeededUser {
        let uuid = Uuid::new_v4();
        let client = Uuid::new_v4();
        self.accounts.push(Account {
            user: UserOut {
                uuid,
                username: username.to_string(),
                name: name.to_string(),
                primary_client_uuid: Some(client),
                identity: uuid.as_bytes().to_vec(),
            },
            client,
            email: email.to_string(),
            password: password.to_string(),
        });
        SeededUser { uuid, client }
    }

    fn account(&self, uuid: Uuid) -> Option<&Account> {
        self.accounts.iter().find(|a| a.user.uuid == uuid)
    }

    fn group_info(&self, uuid: Uuid) -> Option<UserGroupInfo> {
        self.account(uuid).map(|a| UserGroupInfo {
            info: a.user.clone(),
            clients: vec![a.client],
        })
    }

    fn me(&self) -> Result<Uuid, EngineError> {
        self.signed_in.ok_or_else(|| fail("not signed in"))
    }

    fn my_group(&mut self, group_uuid: Uuid) -> Result<&mut Group, EngineError> {
        let me = self.me()?;
        self.groups
            .iter_mut()
            .find(|g| g.uuid == group_uuid && g.members.contains_key(&me))
            .ok_or_else(|| fail("not a member"))
    }

    fn register(&mut self, register: Register) -> Result<(), EngineError> {
        if self
            .accounts
            .iter()
            .any(|a| a.user.username == register.username || a.email == register.email)
        {
            return Err(fail("username or email already taken"));
        }
        let user = self.create_account(
            &register.username,
            &register.name,
            &register.email,
            &register.password,
        );
        self.confirm_tokens.insert(Uuid::new_v4(), user.uuid);
        Ok(())
    }

    fn login(&mut self, login: Login) -> Result<Uuid, EngineError> {
        let account = self
            .accounts
            .iter()
            .find(|a| {
                (a.user.username == login.username_or_email || a.email == login.username_or_email)
                    && a.password == login.password
            })
            .ok_or_else(|| fail("invalid credentials"))?;
        let uuid = account.user.uuid;
        self.signed_in = Some(uuid);
        Ok(uuid)
    }

    fn logout(&mut self) -> Result<(), EngineError> {
        self.me()?;
        self.signed_in = None;
        Ok(())
    }

    fn forgot(&mut self, forgot: Forgot) -> Result<(), EngineError> {
        if let Some(account) = self.accounts.iter().find(|a| a.email == forgot.email) {
            let user = account.user.uuid;
            self.reset_tokens.insert(Uuid::new_v4(), user);
        }
        Ok(())
    }

    fn confirm(&mut self, confirm: Confirm) -> Result<Uuid, EngineError> {
        let user = self
            .confirm_tokens
            .remove(&confirm.token)
            .ok_or_else(|| fail("invalid token"))?;
        self.signed_in = Some(user);
        Ok(user)
    }

    fn forgot_confirm(&mut self, confirm: ForgotConfirm) -> Result<(), EngineError> {
        let user = self
            .reset_tokens
            .remove(&confirm.token)
            .ok_or_else(|| fail("invalid token"))?;
        if let Some(account) = self.accounts.iter_mut().find(|a| a.user.uuid == user) {
            account.password = confirm.password;
        }
        Ok(())
    }

    fn search(&self, search: Search) -> Result<Vec<UserOut>, EngineError> {
        self.me()?;
        let query = search.query.to_lowercase();
        Ok(self
            .accounts
            .iter()
            .filter(|a| {
                a.user.username.to_lowercase().contains(&query)
                    || a.user.name.to_lowercase().contains(&query)
            })
            .map(|a| a.user.clone())
            .collect())
    }

    fn get_groups(&self) -> Result<Vec<Group>, EngineError> {
        let me = self.me()?;
        Ok(self
            .groups
            .iter()
            .filter(|g| g.members.contains_key(&me))
            .cloned()
            .collect())
    }

    fn create_group(&mut self) -> Result<Uuid, EngineError> {
        let me = self.me()?;
        let info = self.group_info(me).ok_or_else(|| fail("unknown account"))?;
        let uuid = Uuid::new_v4();
        self.groups.push(Group {
            uuid,
            name: None,
            image: None,
            members: BTreeMap::from([(me, info)]),
        });
        Ok(uuid)
    }

    fn update_group(&mut self, update: UpdateGroup) -> Result<(), EngineError> {
        let group = self.my_group(update.group_uuid)?;
        group.name = update.name;
        Ok(())
    }

    fn add_member(&mut self, add: AddMember) -> Result<(), EngineError> {
        let info = self
            .group_info(add.user_uuid)
            .ok_or_else(|| fail("unknown user"))?;
        let group = self.my_group(add.group_uuid)?;
        group.members.insert(add.user_uuid, info);
        Ok(())
    }

    fn remove_member(&mut self, remove: RemoveMember) -> Result<(), EngineError> {
        let group = self.my_group(remove.group_uuid)?;
        group
            .members
            .remove(&remove.user_uuid)
            .map(|_| ())
            .ok_or_else(|| fail("user is not in the group"))
    }

    fn leave_group(&mut self, leave: LeaveGroup) -> Result<(), EngineError> {
        let me = self.me()?;
        let group = self.my_group(leave.group_uuid)?;
        group.members.remove(&me);
        self.groups.retain(|g| !g.members.is_empty());
        Ok(())
    }

    fn send_group_status(&mut self, send: SendGroupStatus) -> Result<(), ()> {
        self.my_group(send.group_uuid).map(|_| ()).map_err(|_| ())
    }

    fn get_location(&self, get: GetLocation) -> Result<Vec<LocationSample>, ()> {
        if !self.groups.iter().any(|g| g.uuid == get.group_uuid) {
            return Err(());
        }
        let mut samples: Vec<LocationSample> = self
            .samples
            .get(&(get.group_uuid, get.client))
            .map(|all| {
                all.iter()
                    .filter(|s| s.timestamp < get.before_timestamp)
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        samples.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        samples.truncate(get.amount as usize);
        Ok(samples)
    }

    fn get_num_location(&self, get: GetNumLocation) -> Result<i64, ()> {
        let count = self
            .samples
            .get(&(get.group_uuid, get.client))
            .map(|all| {
                all.iter()
                    .filter(|s| s.timestamp >= get.from_timestamp && s.timestamp <= get.to_timestamp)
                    .count()
            })
            .unwrap_or(0);
        Ok(count as i64)
    }

    fn send_location(&mut self, send: SendLocation) -> Result<(), ()> {
        let me = self.me().map_err(|_| ())?;
        let client = self.account(me).map(|a| a.client).ok_or(())?;
        self.my_group(send.group_uuid).map_err(|_| ())?;
        self.samples
            .entry((send.group_uuid, client))
            .or_default()
            .push(LocationSample {
                latitude: send.latitude,
                longitude: send.longitude,
                timestamp: send.timestamp,
            });
        Ok(())
    }
}
