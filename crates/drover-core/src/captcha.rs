//! Captcha task broker: mediates between plugins producing challenges and
//! solvers (addon handlers or connected human clients) consuming them.
//!
//! Task state machine: `init → waiting → (user | shared-user) → done`;
//! timeout or invalidation terminates in `error`. `user` is exclusive to the
//! reserving client, `shared-user` accepts any client's answer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::plugin::{AddonBus, AddonPlugin};

/// How long after the last poll a human client counts as connected.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

const NO_CLIENT_ERROR: &str = "No client connected for captcha decrypting";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptchaStatus {
    Init,
    Waiting,
    User,
    SharedUser,
    Done,
    Error,
}

impl CaptchaStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CaptchaStatus::Init => "init",
            CaptchaStatus::Waiting => "waiting",
            CaptchaStatus::User => "user",
            CaptchaStatus::SharedUser => "shared-user",
            CaptchaStatus::Done => "done",
            CaptchaStatus::Error => "error",
        }
    }
}

/// What kind of answer the challenge expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptchaResultType {
    /// Text written on the image.
    Textual,
    /// A click position on the image.
    Positional,
    /// Token from an interactive widget.
    Interactive,
}

impl CaptchaResultType {
    pub fn as_str(self) -> &'static str {
        match self {
            CaptchaResultType::Textual => "textual",
            CaptchaResultType::Positional => "positional",
            CaptchaResultType::Interactive => "interactive",
        }
    }
}

/// A submitted solution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptchaResult {
    Text(String),
    Position(i32, i32),
}

/// One open challenge. Shared between the broker, the producing plugin, and
/// any registered handlers.
pub struct CaptchaTask {
    /// Stringified monotonic counter; RPC ids are strings on the wire.
    pub id: String,
    pub format: String,
    pub params: serde_json::Value,
    pub result_type: CaptchaResultType,

    status: Mutex<CaptchaStatus>,
    handlers: Mutex<Vec<Arc<dyn AddonPlugin>>>,
    result: Mutex<Option<CaptchaResult>>,
    wait_until: Mutex<Option<Instant>>,
    error: Mutex<Option<String>>,
    /// Handler scratch space, opaque to the broker.
    data: Mutex<HashMap<String, String>>,
}

impl CaptchaTask {
    fn new(
        id: u64,
        format: impl Into<String>,
        params: serde_json::Value,
        result_type: CaptchaResultType,
    ) -> Arc<Self> {
        Arc::new(CaptchaTask {
            id: id.to_string(),
            format: format.into(),
            params,
            result_type,
            status: Mutex::new(CaptchaStatus::Init),
            handlers: Mutex::new(Vec::new()),
            result: Mutex::new(None),
            wait_until: Mutex::new(None),
            error: Mutex::new(None),
            data: Mutex::new(HashMap::new()),
        })
    }

    pub fn status(&self) -> CaptchaStatus {
        *self.status.lock().unwrap()
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().unwrap().clone()
    }

    /// Extend the solution deadline and move to `waiting`. Deadlines only
    /// ever move forward.
    pub fn set_waiting(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut until = self.wait_until.lock().unwrap();
        *until = Some(match *until {
            Some(prev) => prev.max(deadline),
            None => deadline,
        });
        *self.status.lock().unwrap() = CaptchaStatus::Waiting;
    }

    /// Reserve the task for a polling client.
    pub fn set_waiting_for_user(&self, exclusive: bool) {
        *self.status.lock().unwrap() = if exclusive {
            CaptchaStatus::User
        } else {
            CaptchaStatus::SharedUser
        };
    }

    /// Store a solution. Textual/interactive answers are kept verbatim;
    /// positional answers parse `"x,y"`, storing nothing when malformed.
    pub fn set_result(&self, raw: &str) {
        let parsed = match self.result_type {
            CaptchaResultType::Textual | CaptchaResultType::Interactive => {
                Some(CaptchaResult::Text(raw.to_string()))
            }
            CaptchaResultType::Positional => {
                let mut parts = raw.split(',');
                match (
                    parts.next().and_then(|s| s.trim().parse().ok()),
                    parts.next().and_then(|s| s.trim().parse().ok()),
                ) {
                    (Some(x), Some(y)) => Some(CaptchaResult::Position(x, y)),
                    _ => None,
                }
            }
        };
        *self.result.lock().unwrap() = parsed;
        *self.status.lock().unwrap() = CaptchaStatus::Done;
    }

    pub fn result(&self) -> Option<CaptchaResult> {
        self.result.lock().unwrap().clone()
    }

    pub fn timed_out(&self) -> bool {
        match *self.wait_until.lock().unwrap() {
            Some(deadline) => Instant::now() > deadline,
            None => false,
        }
    }

    /// True while the task still awaits a solution.
    pub fn is_waiting(&self) -> bool {
        if self.result.lock().unwrap().is_some() || self.error.lock().unwrap().is_some() {
            return false;
        }
        !self.timed_out()
    }

    /// Report the stored solution as correct to all handlers.
    pub fn correct(&self, task: &Arc<CaptchaTask>) {
        for handler in self.handlers.lock().unwrap().iter() {
            handler.captcha_correct(task);
        }
    }

    /// Report the stored solution as wrong; terminal for the task.
    pub fn invalid(&self, task: &Arc<CaptchaTask>) {
        for handler in self.handlers.lock().unwrap().iter() {
            handler.captcha_invalid(task);
        }
        *self.status.lock().unwrap() = CaptchaStatus::Error;
    }

    pub fn has_handlers(&self) -> bool {
        !self.handlers.lock().unwrap().is_empty()
    }

    fn register_handler(&self, handler: Arc<dyn AddonPlugin>) {
        self.handlers.lock().unwrap().push(handler);
    }

    fn set_error(&self, msg: &str) {
        *self.error.lock().unwrap() = Some(msg.to_string());
        *self.status.lock().unwrap() = CaptchaStatus::Error;
    }

    pub fn data(&self, key: &str) -> Option<String> {
        self.data.lock().unwrap().get(key).cloned()
    }

    pub fn set_data(&self, key: &str, value: &str) {
        self.data
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }

    /// Reachable through `get_task_by_id`: not yet solved, not failed, not
    /// expired.
    fn is_open(&self) -> bool {
        matches!(
            self.status(),
            CaptchaStatus::Init
                | CaptchaStatus::Waiting
                | CaptchaStatus::User
                | CaptchaStatus::SharedUser
        ) && !self.timed_out()
    }
}

struct BrokerInner {
    tasks: Vec<Arc<CaptchaTask>>,
    next_id: u64,
}

/// Queue of open challenges. One mutex guards the whole task list; every
/// mutation and lookup goes through it.
pub struct CaptchaBroker {
    inner: Mutex<BrokerInner>,
    last_client: Mutex<Option<Instant>>,
}

impl CaptchaBroker {
    pub fn new() -> Self {
        CaptchaBroker {
            inner: Mutex::new(BrokerInner {
                tasks: Vec::new(),
                next_id: 0,
            }),
            last_client: Mutex::new(None),
        }
    }

    /// Create a task without enqueuing it; call `handle_captcha` to offer it.
    pub fn new_task(
        &self,
        format: impl Into<String>,
        params: serde_json::Value,
        result_type: CaptchaResultType,
    ) -> Arc<CaptchaTask> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        CaptchaTask::new(id, format, params, result_type)
    }

    /// Offer `task` to every captcha-capable addon, then enqueue it when at
    /// least one handler attached or a human client is connected. Returns
    /// false (with `task.error` set) when nobody can solve it.
    pub fn handle_captcha(
        &self,
        addons: &AddonBus,
        task: &Arc<CaptchaTask>,
        timeout: Duration,
    ) -> bool {
        let client = self.client_connected();
        task.set_waiting(timeout);

        for addon in addons.captcha_addons() {
            if addon.new_captcha_task(task) {
                task.register_handler(addon);
            }
        }

        if task.has_handlers() || client {
            self.inner.lock().unwrap().tasks.push(Arc::clone(task));
            return true;
        }

        task.set_error(NO_CLIENT_ERROR);
        false
    }

    /// First task a client may work on.
    pub fn get_task(&self) -> Option<Arc<CaptchaTask>> {
        self.inner
            .lock()
            .unwrap()
            .tasks
            .iter()
            .find(|t| matches!(t.status(), CaptchaStatus::Waiting | CaptchaStatus::SharedUser))
            .cloned()
    }

    /// Lookup by wire id; closed (done/error/expired) tasks are unreachable.
    pub fn get_task_by_id(&self, tid: &str) -> Option<Arc<CaptchaTask>> {
        self.inner
            .lock()
            .unwrap()
            .tasks
            .iter()
            .find(|t| t.id == tid && t.is_open())
            .cloned()
    }

    pub fn remove_task(&self, task: &Arc<CaptchaTask>) {
        self.inner.lock().unwrap().tasks.retain(|t| t.id != task.id);
    }

    /// Drop tasks nobody can retrieve anymore.
    pub fn purge_closed(&self) {
        self.inner.lock().unwrap().tasks.retain(|t| t.is_open());
    }

    /// Record a human client poll; keeps `client_connected` true for 30 s.
    pub fn touch_client(&self) {
        *self.last_client.lock().unwrap() = Some(Instant::now());
    }

    pub fn client_connected(&self) -> bool {
        self.last_client
            .lock()
            .unwrap()
            .map(|t| t.elapsed() < CLIENT_TIMEOUT)
            .unwrap_or(false)
    }
}

impl Default for CaptchaBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::AddonCaps;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSolver {
        accepts: bool,
        correct: AtomicUsize,
        invalid: AtomicUsize,
    }

    impl CountingSolver {
        fn new(accepts: bool) -> Arc<Self> {
            Arc::new(CountingSolver {
                accepts,
                correct: AtomicUsize::new(0),
                invalid: AtomicUsize::new(0),
            })
        }
    }

    impl AddonPlugin for CountingSolver {
        fn name(&self) -> &str {
            "counting-solver"
        }

        fn new_captcha_task(&self, _task: &Arc<CaptchaTask>) -> bool {
            self.accepts
        }

        fn captcha_correct(&self, _task: &Arc<CaptchaTask>) {
            self.correct.fetch_add(1, Ordering::Relaxed);
        }

        fn captcha_invalid(&self, _task: &Arc<CaptchaTask>) {
            self.invalid.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn broker_task(broker: &CaptchaBroker, rt: CaptchaResultType) -> Arc<CaptchaTask> {
        broker.new_task("png", json!({"image": "base64data"}), rt)
    }

    #[test]
    fn no_handler_and_no_client_drops_task() {
        let broker = CaptchaBroker::new();
        let addons = AddonBus::new();
        let task = broker_task(&broker, CaptchaResultType::Textual);
        let accepted = broker.handle_captcha(&addons, &task, Duration::from_secs(60));
        assert!(!accepted);
        assert!(task.error().is_some());
        assert_eq!(task.status(), CaptchaStatus::Error);
        assert!(broker.get_task().is_none());
    }

    #[test]
    fn connected_client_is_enough_to_enqueue() {
        let broker = CaptchaBroker::new();
        let addons = AddonBus::new();
        broker.touch_client();
        let task = broker_task(&broker, CaptchaResultType::Textual);
        assert!(broker.handle_captcha(&addons, &task, Duration::from_secs(60)));
        assert_eq!(broker.get_task().unwrap().id, task.id);
    }

    #[test]
    fn addon_handler_registers_through_offer() {
        let broker = CaptchaBroker::new();
        let addons = AddonBus::new();
        let solver = CountingSolver::new(true);
        addons.register(solver.clone(), AddonCaps { captcha: true, ..Default::default() });
        let task = broker_task(&broker, CaptchaResultType::Textual);
        assert!(broker.handle_captcha(&addons, &task, Duration::from_secs(60)));
        assert!(task.has_handlers());

        task.correct(&task);
        task.invalid(&task);
        assert_eq!(solver.correct.load(Ordering::Relaxed), 1);
        assert_eq!(solver.invalid.load(Ordering::Relaxed), 1);
        assert_eq!(task.status(), CaptchaStatus::Error);
    }

    #[test]
    fn declining_addon_does_not_count_as_handler() {
        let broker = CaptchaBroker::new();
        let addons = AddonBus::new();
        addons.register(
            CountingSolver::new(false),
            AddonCaps { captcha: true, ..Default::default() },
        );
        let task = broker_task(&broker, CaptchaResultType::Textual);
        assert!(!broker.handle_captcha(&addons, &task, Duration::from_secs(60)));
    }

    #[test]
    fn positional_result_parses_pair() {
        let broker = CaptchaBroker::new();
        let task = broker_task(&broker, CaptchaResultType::Positional);
        task.set_result("17,42");
        assert_eq!(task.result(), Some(CaptchaResult::Position(17, 42)));
        let task2 = broker_task(&broker, CaptchaResultType::Positional);
        task2.set_result("garbage");
        assert_eq!(task2.result(), None);
    }

    #[test]
    fn task_ids_are_monotonic_strings() {
        let broker = CaptchaBroker::new();
        let a = broker_task(&broker, CaptchaResultType::Textual);
        let b = broker_task(&broker, CaptchaResultType::Textual);
        assert_eq!(a.id, "0");
        assert_eq!(b.id, "1");
    }

    #[test]
    fn lookup_excludes_done_and_expired() {
        let broker = CaptchaBroker::new();
        broker.touch_client();
        let addons = AddonBus::new();

        let done = broker_task(&broker, CaptchaResultType::Textual);
        broker.handle_captcha(&addons, &done, Duration::from_secs(60));
        done.set_result("answer");
        assert!(broker.get_task_by_id(&done.id).is_none());

        let expired = broker_task(&broker, CaptchaResultType::Textual);
        broker.handle_captcha(&addons, &expired, Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));
        assert!(broker.get_task_by_id(&expired.id).is_none());
        assert!(!expired.is_waiting());

        let open = broker_task(&broker, CaptchaResultType::Textual);
        broker.handle_captcha(&addons, &open, Duration::from_secs(60));
        assert!(broker.get_task_by_id(&open.id).is_some());
        assert!(open.is_waiting());
    }

    #[test]
    fn exclusive_reservation_blocks_get_task() {
        let broker = CaptchaBroker::new();
        broker.touch_client();
        let addons = AddonBus::new();
        let task = broker_task(&broker, CaptchaResultType::Textual);
        broker.handle_captcha(&addons, &task, Duration::from_secs(60));

        task.set_waiting_for_user(true);
        assert!(broker.get_task().is_none(), "user-reserved task is exclusive");
        task.set_waiting_for_user(false);
        assert!(broker.get_task().is_some(), "shared-user task is offered again");
    }
}
