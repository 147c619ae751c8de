use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{BridgeError, BridgeResult};

pub use uuid::Uuid;

/// Maximum size of a JSON-lines frame exchanged with the engine host (4 MiB).
/// Group lists carry avatar bytes, so this is larger than a typical request.
pub const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Session handle
// ---------------------------------------------------------------------------

/// Opaque token naming one live engine session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionHandle(pub u64);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The unit handed to the engine entry point: `{instance, method, args}`.
#[derive(Debug, Serialize)]
pub struct Envelope<'a, A: Serialize> {
    pub instance: Option<SessionHandle>,
    pub method: &'a str,
    pub args: &'a A,
}

impl<A: Serialize> Envelope<'_, A> {
    pub fn to_json(&self) -> BridgeResult<String> {
        serde_json::to_string(self)
            .map_err(|err| BridgeError::protocol(self.method, format!("encode args: {err}")))
    }
}

/// Engine-side view of an envelope, used by engine hosts to route a call.
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingEnvelope {
    pub instance: Option<SessionHandle>,
    pub method: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Tagged result
// ---------------------------------------------------------------------------

/// Decoded reply of method `M`: the engine's success or failure value.
pub type Reply<M> = Result<<M as Method>::Output, <M as Method>::Failure>;

#[derive(Deserialize)]
struct RawReply {
    #[serde(alias = "success")]
    ok: bool,
    #[serde(default)]
    value: serde_json::Value,
}

/// Decode `{ok, value}` into `Ok(T)` / `Err(E)`.
///
/// Anything that is not a tagged result of the declared types is a protocol
/// error, never a failure value.
pub fn decode_reply<T, E>(method: &str, raw: &str) -> BridgeResult<Result<T, E>>
where
    T: DeserializeOwned,
    E: DeserializeOwned,
{
    let reply: RawReply = serde_json::from_str(raw)
        .map_err(|err| BridgeError::protocol(method, format!("reply is not a tagged result: {err}")))?;
    if reply.ok {
        serde_json::from_value(reply.value)
            .map(Ok)
            .map_err(|err| BridgeError::protocol(method, format!("unexpected success value: {err}")))
    } else {
        serde_json::from_value(reply.value)
            .map(Err)
            .map_err(|err| BridgeError::protocol(method, format!("unexpected failure value: {err}")))
    }
}

/// Encode a reply the way the engine does. Used by engine hosts and tests.
pub fn encode_reply<T: Serialize, E: Serialize>(result: &Result<T, E>) -> String {
    let value = match result {
        Ok(value) => serde_json::json!({ "ok": true, "value": value }),
        Err(value) => serde_json::json!({ "ok": false, "value": value }),
    };
    value.to_string()
}

/// Failure value of most engine methods. The engine sends either a bare
/// string or `{"message": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineError {
    pub message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl<'de> Deserialize<'de> for EngineError {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Object { message: String },
        }
        match Repr::deserialize(deserializer)? {
            Repr::Text(message) | Repr::Object { message } => Ok(Self { message }),
        }
    }
}

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

/// Engine status. The account is signed in iff `account_data` is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub domain: String,
    #[serde(default)]
    pub data_directory: String,
    #[serde(default)]
    pub account_data: Option<AccountData>,
}

impl Status {
    pub fn is_authenticated(&self) -> bool {
        self.account_data.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountData {
    pub user_uuid: Uuid,
    #[serde(default)]
    pub client_uuid: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserOut {
    pub uuid: Uuid,
    pub username: String,
    pub name: String,
    #[serde(default)]
    pub primary_client_uuid: Option<Uuid>,
    /// Public identity key material; base64 on the wire.
    #[serde(default, with = "base64_bytes")]
    pub identity: Vec<u8>,
}

/// One member of a group and the devices it uses there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserGroupInfo {
    pub info: UserOut,
    #[serde(default)]
    pub clients: Vec<Uuid>,
}

impl UserGroupInfo {
    /// The device whose location represents this member: the primary client
    /// when it belongs to the group, otherwise the first listed one.
    pub fn tracked_client(&self) -> Option<Uuid> {
        self.info
            .primary_client_uuid
            .filter(|primary| self.clients.contains(primary))
            .or_else(|| self.clients.first().copied())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub uuid: Uuid,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub image: Option<Vec<u8>>,
    #[serde(default)]
    pub members: BTreeMap<Uuid, UserGroupInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// A member joined with its latest sample. Derived, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserLocation {
    pub user: UserOut,
    pub client_uuid: Uuid,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: i64,
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Method surface
// ---------------------------------------------------------------------------

/// A typed engine method: its wire name, argument shape (`Self`) and the
/// success/failure types of its reply.
pub trait Method: Serialize {
    const NAME: &'static str;
    const REQUIRES_SESSION: bool = true;
    type Output: DeserializeOwned;
    type Failure: FailureValue;
}

/// A method's declared failure type, convertible to a user-facing error.
pub trait FailureValue: DeserializeOwned {
    fn into_engine_error(self, method: &str) -> EngineError;
}

impl FailureValue for EngineError {
    fn into_engine_error(self, _method: &str) -> EngineError {
        self
    }
}

impl FailureValue for String {
    fn into_engine_error(self, _method: &str) -> EngineError {
        EngineError::new(self)
    }
}

/// Methods that declare no failure value still carry the tag.
impl FailureValue for () {
    fn into_engine_error(self, method: &str) -> EngineError {
        EngineError::new(format!("{method} failed"))
    }
}

macro_rules! method {
    ($ty:ty, $name:literal, $output:ty, $failure:ty) => {
        impl Method for $ty {
            const NAME: &'static str = $name;
            type Output = $output;
            type Failure = $failure;
        }
    };
}

/// Create the engine session. The only method that runs without a handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Init {
    #[serde(rename = "dataDir")]
    pub data_dir: String,
}

impl Method for Init {
    const NAME: &'static str = "init";
    const REQUIRES_SESSION: bool = false;
    type Output = SessionHandle;
    type Failure = String;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetStatus {}
method!(GetStatus, "status", Status, ());

// -- Account --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Register {
    pub username: String,
    pub password: String,
    pub name: String,
    pub email: String,
}
method!(Register, "register", (), EngineError);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Login {
    pub username_or_email: String,
    pub password: String,
}
method!(Login, "login", Uuid, EngineError);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Logout {}
method!(Logout, "logout", (), EngineError);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Forgot {
    pub email: String,
}
method!(Forgot, "forgot", (), EngineError);

/// Confirm an emailed registration token; signs the user in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Confirm {
    pub token: Uuid,
}
method!(Confirm, "confirm", Uuid, EngineError);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgotCheck {
    pub token: Uuid,
}
method!(ForgotCheck, "forgot_check", bool, EngineError);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgotConfirm {
    pub password: String,
    pub token: Uuid,
}
method!(ForgotConfirm, "forgot_confirm", (), EngineError);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Search {
    pub query: String,
}
method!(Search, "search", Vec<UserOut>, EngineError);

// -- Groups --

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetGroups {}
method!(GetGroups, "get_groups", Vec<Group>, EngineError);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateGroup {}
method!(CreateGroup, "create_group", Uuid, EngineError);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateGroup {
    pub group_uuid: Uuid,
    pub name: Option<String>,
}
method!(UpdateGroup, "update_group", (), EngineError);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddMember {
    pub group_uuid: Uuid,
    pub user_uuid: Uuid,
}
method!(AddMember, "add_member", (), EngineError);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveMember {
    pub group_uuid: Uuid,
    pub user_uuid: Uuid,
}
method!(RemoveMember, "remove_member", (), EngineError);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveGroup {
    pub group_uuid: Uuid,
}
method!(LeaveGroup, "leave_group", (), EngineError);

/// Tell the group's members that its membership changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendGroupStatus {
    pub group_uuid: Uuid,
}
method!(SendGroupStatus, "send_group_status", (), ());

// -- Location --

/// Up to `amount` samples of `client` taken strictly before
/// `before_timestamp`, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetLocation {
    pub group_uuid: Uuid,
    pub client: Uuid,
    pub before_timestamp: i64,
    pub amount: u32,
}
method!(GetLocation, "get_location", Vec<LocationSample>, ());

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetNumLocation {
    pub group_uuid: Uuid,
    pub client: Uuid,
    pub from_timestamp: i64,
    pub to_timestamp: i64,
}
method!(GetNumLocation, "get_num_location", i64, ());

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendLocation {
    pub group_uuid: Uuid,
    pub longitude: f64,
    pub latitude: f64,
    pub timestamp: i64,
}
method!(SendLocation, "send_location", (), ());

// -- Messaging plumbing --

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReceiveMessages {}
method!(ReceiveMessages, "receive_messages", (), EngineError);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplaceKeyPackages {}
method!(ReplaceKeyPackages, "replace_key_packages", (), EngineError);

// ---------------------------------------------------------------------------
// Dispatch table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSpec {
    pub name: &'static str,
    pub requires_session: bool,
}

const fn spec<M: Method>() -> MethodSpec {
    MethodSpec {
        name: M::NAME,
        requires_session: M::REQUIRES_SESSION,
    }
}

/// Every method the engine exposes.
pub const METHODS: &[MethodSpec] = &[
    spec::<Init>(),
    spec::<GetStatus>(),
    spec::<Register>(),
    spec::<Login>(),
    spec::<Logout>(),
    spec::<Forgot>(),
    spec::<Confirm>(),
    spec::<ForgotCheck>(),
    spec::<ForgotConfirm>(),
    spec::<Search>(),
    spec::<GetGroups>(),
    spec::<CreateGroup>(),
    spec::<UpdateGroup>(),
    spec::<AddMember>(),
    spec::<RemoveMember>(),
    spec::<LeaveGroup>(),
    spec::<SendGroupStatus>(),
    spec::<GetLocation>(),
    spec::<GetNumLocation>(),
    spec::<SendLocation>(),
    spec::<ReceiveMessages>(),
    spec::<ReplaceKeyPackages>(),
];

pub fn lookup(name: &str) -> Option<&'static MethodSpec> {
    METHODS.iter().find(|spec| spec.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_success_value() {
        let raw = r#"{"ok":true,"value":{"domain":"bubble.app","account_data":null}}"#;
        let status: Result<Status, ()> = decode_reply("status", raw).unwrap();
        let status = status.unwrap();
        assert_eq!(status.domain, "bubble.app");
        assert!(!status.is_authenticated());
    }

    #[test]
    fn decodes_failure_value() {
        let raw = r#"{"ok":false,"value":"invalid credentials"}"#;
        let reply: Result<Uuid, EngineError> = decode_reply("login", raw).unwrap();
        assert_eq!(reply.unwrap_err().message, "invalid credentials");

        let raw = r#"{"ok":false,"value":{"message":"not a member"}}"#;
        let reply: Result<(), EngineError> = decode_reply("leave_group", raw).unwrap();
        assert_eq!(reply.unwrap_err().message, "not a member");
    }

    #[test]
    fn accepts_legacy_success_tag() {
        let raw = r#"{"success":true,"value":7}"#;
        let reply: Result<SessionHandle, String> = decode_reply("init", raw).unwrap();
        assert_eq!(reply.unwrap(), SessionHandle(7));
    }

    #[test]
    fn void_success_may_omit_value() {
        let reply: Result<(), EngineError> = decode_reply("logout", r#"{"ok":true}"#).unwrap();
        assert!(reply.is_ok());
    }

    #[test]
    fn untagged_shapes_are_protocol_errors() {
        for raw in [
            "not json",
            "[]",
            r#"{"value":1}"#,
            r#"{"ok":"yes","value":1}"#,
            r#"{"ok":true,"value":"not-a-number"}"#,
        ] {
            let err = decode_reply::<SessionHandle, String>("init", raw).unwrap_err();
            assert!(
                matches!(err, BridgeError::Protocol { .. }),
                "{raw} should be a protocol error, got {err:?}"
            );
        }
    }

    #[test]
    fn mismatched_failure_value_is_protocol_error() {
        let err = decode_reply::<Uuid, EngineError>("login", r#"{"ok":false,"value":42}"#)
            .unwrap_err();
        assert!(matches!(err, BridgeError::Protocol { .. }));
    }

    #[test]
    fn envelope_shape() {
        let args = LeaveGroup {
            group_uuid: Uuid::nil(),
        };
        let json = Envelope {
            instance: Some(SessionHandle(1)),
            method: LeaveGroup::NAME,
            args: &args,
        }
        .to_json()
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["instance"], 1);
        assert_eq!(value["method"], "leave_group");
        assert_eq!(value["args"]["group_uuid"], Uuid::nil().to_string());
    }

    #[test]
    fn empty_args_serialize_as_object() {
        let json = Envelope {
            instance: None,
            method: GetGroups::NAME,
            args: &GetGroups {},
        }
        .to_json()
        .unwrap();
        assert!(json.contains(r#""args":{}"#));
        assert!(json.contains(r#""instance":null"#));
    }

    #[test]
    fn init_uses_camel_case_data_dir() {
        let json = serde_json::to_value(Init {
            data_dir: "/data".into(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({ "dataDir": "/data" }));
    }

    #[test]
    fn dispatch_table_covers_surface() {
        assert_eq!(lookup("init").map(|s| s.requires_session), Some(false));
        assert_eq!(lookup("get_location").map(|s| s.requires_session), Some(true));
        assert!(lookup("drop_tables").is_none());
        assert!(METHODS.iter().filter(|s| !s.requires_session).count() == 1);
    }

    #[test]
    fn tracked_client_prefers_primary_in_group() {
        let primary = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut info = UserGroupInfo {
            info: UserOut {
                uuid: Uuid::new_v4(),
                username: "alice".into(),
                name: "Alice".into(),
                primary_client_uuid: Some(primary),
                identity: vec![1, 2, 3],
            },
            clients: vec![other, primary],
        };
        assert_eq!(info.tracked_client(), Some(primary));

        info.clients = vec![other];
        assert_eq!(info.tracked_client(), Some(other));

        info.clients.clear();
        assert_eq!(info.tracked_client(), None);
    }

    #[test]
    fn identity_is_base64_on_the_wire() {
        let user = UserOut {
            uuid: Uuid::nil(),
            username: "bob".into(),
            name: "Bob".into(),
            primary_client_uuid: None,
            identity: b"key".to_vec(),
        };
        let value = serde_json::to_value(&user).unwrap();
        assert_eq!(value["identity"], "a2V5");
        let back: UserOut = serde_json::from_value(value).unwrap();
        assert_eq!(back, user);
    }
}
