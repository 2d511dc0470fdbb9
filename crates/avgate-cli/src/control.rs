use avgate_macro::{MacroRecord, MacroStore, Scheduler};
use avgate_serial::{SerialCommand, SerialHandle};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Debug, Deserialize)]
#[serde(tag = "action")]
enum MacroRequest {
    #[serde(rename = "macro.list")]
    List,
    #[serde(rename = "macro.get")]
    Get { id: String },
    #[serde(rename = "macro.save")]
    Save {
        #[serde(rename = "macro")]
        record: MacroRecord,
    },
    #[serde(rename = "macro.delete")]
    Delete { id: String },
    #[serde(rename = "macro.run")]
    Run { id: String },
}

#[derive(Debug)]
enum Request {
    Macro(MacroRequest),
    Serial(SerialCommand),
}

fn parse(line: &str) -> Result<Request, serde_json::Error> {
    let v: Value = serde_json::from_str(line)?;
    let is_macro = v.get("action").and_then(Value::as_str).is_some_and(|a| a.starts_with("macro."));
    if is_macro {
        Ok(Request::Macro(serde_json::from_value(v)?))
    } else {
        Ok(Request::Serial(serde_json::from_value(v)?))
    }
}

fn failed(e: impl std::fmt::Display) -> Value {
    json!({ "ok": false, "error": e.to_string() })
}

/// JSON-lines control console. Every request line gets exactly one reply.
pub struct Control {
    store: Arc<Mutex<MacroStore>>,
    scheduler: Scheduler,
    serial: SerialHandle,
}

impl Control {
    pub fn new(store: Arc<Mutex<MacroStore>>, scheduler: Scheduler, serial: SerialHandle) -> Self {
        Self { store, scheduler, serial }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn handle(&self, line: &str) -> Value {
        let req = match parse(line) {
            Ok(r) => r,
            Err(e) => {
                debug!("console: bad request: {}", e);
                return failed(e);
            }
        };

        match req {
            Request::Serial(cmd) => match self.serial.submit(cmd) {
                Ok(()) => json!({ "ok": true }),
                Err(e) => failed(e),
            },
            Request::Macro(MacroRequest::List) => {
                let list = self.store.lock().unwrap().list();
                json!({ "ok": true, "macros": list })
            }
            Request::Macro(MacroRequest::Get { id }) => match self.store.lock().unwrap().get(&id) {
                Some(m) => json!({ "ok": true, "macro": m }),
                None => json!({}),
            },
            Request::Macro(MacroRequest::Save { record }) => match self.store.lock().unwrap().save(record) {
                Ok(id) => json!({ "ok": true, "id": id }),
                Err(e) => failed(e),
            },
            Request::Macro(MacroRequest::Delete { id }) => match self.store.lock().unwrap().delete(&id) {
                Ok(_) => json!({ "ok": true }),
                Err(e) => failed(e),
            },
            Request::Macro(MacroRequest::Run { id }) => match self.scheduler.run(&id) {
                Ok(()) => json!({ "ok": true }),
                Err(e) => failed(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avgate_macro::{MemoryBlobStore, StepConfig, StepExecutor};
    use avgate_proto::EventBus;
    use avgate_serial::{MemoryLine, SerialManager};

    fn console() -> (Control, SerialManager, MemoryLine) {
        let events = EventBus::default();
        let line = MemoryLine::new(9600);
        let mgr = SerialManager::new(Box::new(line.clone()), 9600, events.clone());
        let store = Arc::new(Mutex::new(MacroStore::load(Box::new(MemoryBlobStore::default())).unwrap()));
        let sched = Scheduler::new(store.clone(), StepExecutor::new(&StepConfig::default()), events);
        (Control::new(store, sched, mgr.handle()), mgr, line)
    }

    #[test]
    fn macro_crud_round_trip() {
        let (c, _mgr, _line) = console();
        let saved = c.handle(r#"{"action":"macro.save","macro":{"name":"Room on","steps":[{"type":"delay","delay":100}]}}"#);
        assert_eq!(saved["ok"], true);
        let id = saved["id"].as_str().unwrap().to_string();

        let list = c.handle(r#"{"action":"macro.list"}"#);
        assert_eq!(list["macros"][0]["stepCount"], 1);

        let got = c.handle(&format!(r#"{{"action":"macro.get","id":"{}"}}"#, id));
        assert_eq!(got["macro"]["name"], "Room on");

        assert_eq!(c.handle(&format!(r#"{{"action":"macro.delete","id":"{}"}}"#, id))["ok"], true);
        assert_eq!(c.handle(&format!(r#"{{"action":"macro.get","id":"{}"}}"#, id)), json!({}));
    }

    #[test]
    fn second_run_is_refused() {
        let (c, _mgr, _line) = console();
        let id = c.handle(r#"{"action":"macro.save","macro":{"name":"A"}}"#)["id"].as_str().unwrap().to_string();
        let run = format!(r#"{{"action":"macro.run","id":"{}"}}"#, id);
        assert_eq!(c.handle(&run)["ok"], true);
        let busy = c.handle(&run);
        assert_eq!(busy["ok"], false);
        assert!(busy["error"].as_str().unwrap().contains("already running"));
    }

    #[test]
    fn serial_actions_reach_the_manager() {
        let (c, mut mgr, line) = console();
        assert_eq!(c.handle(r#"{"action":"send","data":"PING","suffix":"crlf"}"#)["ok"], true);
        assert_eq!(c.handle(r#"{"action":"baud","baud":19200}"#)["ok"], true);
        mgr.pump();
        assert_eq!(line.take_tx(), b"PING\r\n");
        assert_eq!(mgr.baud(), 19200);
    }

    #[test]
    fn garbage_gets_an_error_reply() {
        let (c, _mgr, _line) = console();
        assert_eq!(c.handle("not json")["ok"], false);
        assert_eq!(c.handle(r#"{"action":"reboot"}"#)["ok"], false);
        assert_eq!(c.handle(r#"{"action":"macro.save","macro":{"steps":[{"kind":"telnet"}]}}"#)["ok"], false);
    }
}
