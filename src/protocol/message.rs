//! Wire message model: routes, typed value bags, requests and replies

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

/// Enumerated opcode addressing one operation on the daemon or a helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Route {
    ContainerCreate,
    ContainerList,
    ContainerBootstrap,
    ContainerCreateProcess,
    ContainerStartProcess,
    ContainerKill,
    ContainerStop,
    ContainerDelete,
    ContainerDial,
    ContainerLogs,
    ContainerStats,
    ContainerWait,
    ContainerResize,
    ContainerShutdown,
    ContainerState,
    ContainerDiskUsage,
    ContainerExport,
    SystemDiskUsage,
    ImageList,
    ImagePull,
    ImagePush,
    ImageSave,
    ImageLoad,
    ImageTag,
    ImageDelete,
    ImageUnpack,
    SnapshotGet,
    SnapshotDelete,
    VolumeList,
    VolumeCreate,
    VolumeDelete,
    VolumeInspect,
    NetworkCreate,
    NetworkDelete,
    NetworkList,
    NetworkInspect,
}

/// One typed value in a message bag.
///
/// `FileHandle` carries an index into the frame's passed-descriptor array;
/// the descriptors themselves never enter the JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum Value {
    String(String),
    Int64(i64),
    UInt64(u64),
    Bool(bool),
    Data(Vec<u8>),
    FileHandle(u32),
    Endpoint(String),
}

/// String-keyed bag of typed values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageBag(HashMap<String, Value>);

impl MessageBag {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn set(&mut self, key: &str, value: Value) -> &mut Self {
        self.0.insert(key.to_string(), value);
        self
    }

    pub fn set_string(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.set(key, Value::String(value.into()))
    }

    pub fn set_i64(&mut self, key: &str, value: i64) -> &mut Self {
        self.set(key, Value::Int64(value))
    }

    pub fn set_u64(&mut self, key: &str, value: u64) -> &mut Self {
        self.set(key, Value::UInt64(value))
    }

    pub fn set_bool(&mut self, key: &str, value: bool) -> &mut Self {
        self.set(key, Value::Bool(value))
    }

    pub fn set_handle(&mut self, key: &str, index: u32) -> &mut Self {
        self.set(key, Value::FileHandle(index))
    }

    /// Serialize `value` as JSON into a `Data` entry.
    pub fn set_json<T: Serialize>(&mut self, key: &str, value: &T) -> Result<&mut Self> {
        let data = serde_json::to_vec(value)?;
        Ok(self.set(key, Value::Data(data)))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn string(&self, key: &str) -> Result<&str> {
        match self.get(key) {
            Some(Value::String(s)) | Some(Value::Endpoint(s)) => Ok(s),
            Some(_) => Err(bad_type(key, "string")),
            None => Err(missing(key)),
        }
    }

    pub fn i64(&self, key: &str) -> Result<i64> {
        match self.get(key) {
            Some(Value::Int64(v)) => Ok(*v),
            Some(Value::UInt64(v)) => i64::try_from(*v).map_err(|_| bad_type(key, "int64")),
            Some(_) => Err(bad_type(key, "int64")),
            None => Err(missing(key)),
        }
    }

    pub fn u64(&self, key: &str) -> Result<u64> {
        match self.get(key) {
            Some(Value::UInt64(v)) => Ok(*v),
            Some(Value::Int64(v)) => u64::try_from(*v).map_err(|_| bad_type(key, "uint64")),
            Some(_) => Err(bad_type(key, "uint64")),
            None => Err(missing(key)),
        }
    }

    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            Some(Value::Bool(v)) => Ok(*v),
            Some(_) => Err(bad_type(key, "bool")),
            None => Ok(default),
        }
    }

    pub fn data(&self, key: &str) -> Result<&[u8]> {
        match self.get(key) {
            Some(Value::Data(v)) => Ok(v),
            Some(_) => Err(bad_type(key, "data")),
            None => Err(missing(key)),
        }
    }

    /// Index of a passed file handle.
    pub fn handle(&self, key: &str) -> Result<usize> {
        match self.get(key) {
            Some(Value::FileHandle(index)) => Ok(*index as usize),
            Some(_) => Err(bad_type(key, "fileHandle")),
            None => Err(missing(key)),
        }
    }

    pub fn opt_handle(&self, key: &str) -> Result<Option<usize>> {
        match self.get(key) {
            Some(Value::FileHandle(index)) => Ok(Some(*index as usize)),
            Some(_) => Err(bad_type(key, "fileHandle")),
            None => Ok(None),
        }
    }

    /// Deserialize a `Data` entry previously written by `set_json`.
    pub fn json<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<T> {
        let data = self.data(key)?;
        serde_json::from_slice(data)
            .map_err(|e| Error::invalid_argument(format!("malformed {} payload: {}", key, e)))
    }
}

fn missing(key: &str) -> Error {
    Error::invalid_argument(format!("missing required value: {}", key))
}

fn bad_type(key: &str, expected: &str) -> Error {
    Error::invalid_argument(format!("value {} is not a {}", key, expected))
}

/// A request frame: correlation id, route, and the value bag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub route: Route,
    #[serde(default)]
    pub bag: MessageBag,
}

/// An error that crossed the wire, kind preserved for classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for WireError {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<WireError> for Error {
    fn from(err: WireError) -> Self {
        Error::new(err.kind, err.message)
    }
}

/// A reply frame correlated to its request by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub id: u64,
    pub ok: bool,
    #[serde(default)]
    pub bag: MessageBag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Reply {
    /// A successful reply for `request`, preserving correlation.
    pub fn for_request(request_id: u64, bag: MessageBag) -> Self {
        Self {
            id: request_id,
            ok: true,
            bag,
            error: None,
        }
    }

    pub fn for_error(request_id: u64, err: &Error) -> Self {
        Self {
            id: request_id,
            ok: false,
            bag: MessageBag::new(),
            error: Some(WireError::from(err)),
        }
    }

    pub fn into_result(self) -> Result<MessageBag> {
        if self.ok {
            Ok(self.bag)
        } else {
            let err = self
                .error
                .unwrap_or(WireError {
                    kind: ErrorKind::Internal,
                    message: "reply carried no error detail".to_string(),
                });
            Err(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_encoding() {
        let json = serde_json::to_string(&Route::ContainerStartProcess).unwrap();
        assert_eq!(json, "\"containerStartProcess\"");
        let json = serde_json::to_string(&Route::SystemDiskUsage).unwrap();
        assert_eq!(json, "\"systemDiskUsage\"");
    }

    #[test]
    fn test_bag_typed_accessors() {
        let mut bag = MessageBag::new();
        bag.set_string("id", "c1")
            .set_i64("signal", 15)
            .set_u64("port", 8080)
            .set_bool("force", true)
            .set_handle("stdout", 1);

        assert_eq!(bag.string("id").unwrap(), "c1");
        assert_eq!(bag.i64("signal").unwrap(), 15);
        assert_eq!(bag.u64("port").unwrap(), 8080);
        assert!(bag.bool_or("force", false).unwrap());
        assert!(!bag.bool_or("absent", false).unwrap());
        assert_eq!(bag.handle("stdout").unwrap(), 1);
        assert_eq!(bag.opt_handle("stderr").unwrap(), None);

        let err = bag.string("signal").unwrap_err();
        assert!(err.is_kind(ErrorKind::InvalidArgument));
        let err = bag.string("nope").unwrap_err();
        assert!(err.is_kind(ErrorKind::InvalidArgument));
    }

    #[test]
    fn test_json_payload_roundtrip() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Payload {
            name: String,
            size: u64,
        }

        let mut bag = MessageBag::new();
        bag.set_json(
            "volume",
            &Payload {
                name: "data".into(),
                size: 1 << 30,
            },
        )
        .unwrap();

        let back: Payload = bag.json("volume").unwrap();
        assert_eq!(back.name, "data");
        assert_eq!(back.size, 1 << 30);
    }

    #[test]
    fn test_reply_correlation_and_error() {
        let request = Request {
            id: 41,
            route: Route::ContainerStop,
            bag: MessageBag::new(),
        };

        let reply = Reply::for_request(request.id, MessageBag::new());
        assert_eq!(reply.id, 41);
        assert!(reply.into_result().is_ok());

        let err = Error::invalid_state("container is not running");
        let reply = Reply::for_error(request.id, &err);
        assert_eq!(reply.id, 41);
        let back = reply.into_result().unwrap_err();
        assert!(back.is_kind(ErrorKind::InvalidState));
        assert_eq!(back.to_string(), "container is not running");
    }

    #[test]
    fn test_request_roundtrip() {
        let mut bag = MessageBag::new();
        bag.set_string("id", "c1");
        let request = Request {
            id: 7,
            route: Route::ContainerKill,
            bag,
        };
        let json = serde_json::to_vec(&request).unwrap();
        let back: Request = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.id, 7);
        assert_eq!(back.route, Route::ContainerKill);
        assert_eq!(back.bag.string("id").unwrap(), "c1");
    }
}
