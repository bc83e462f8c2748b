//! Operator-local variable store feeding expression evaluation.

use serde_json::{Map, Value};

use crate::expr::{Env, FuncMap};

pub const STEP_RUN_KEY: &str = "run";
pub const VARS_KEY: &str = "vars";
pub const STEPS_KEY: &str = "steps";
pub const LOOP_INDEX_KEY: &str = "i";
pub const INCLUDED_KEY: &str = "included";
pub const PREVIOUS_KEY: &str = "previous";
pub const CURRENT_KEY: &str = "current";

/// Snapshot keys that bound variables are not allowed to shadow.
pub const RESERVED_KEYS: &[&str] = &[
    VARS_KEY,
    STEPS_KEY,
    LOOP_INDEX_KEY,
    INCLUDED_KEY,
    PREVIOUS_KEY,
    CURRENT_KEY,
];

/// Per-operator variable storage. Step results accumulate either as an
/// ordered list or keyed by step name; exactly one of the two is
/// authoritative, fixed at construction.
pub struct Store {
    vars: Map<String, Value>,
    funcs: FuncMap,
    bind_vars: Map<String, Value>,
    steps: Vec<Value>,
    step_map: Map<String, Value>,
    step_keys: Vec<String>,
    loop_index: Option<usize>,
    use_map: bool,
}

impl Store {
    pub fn new(vars: Map<String, Value>, funcs: FuncMap, use_map: bool, step_keys: Vec<String>) -> Self {
        Self {
            vars,
            funcs,
            bind_vars: Map::new(),
            steps: Vec::new(),
            step_map: Map::new(),
            step_keys,
            loop_index: None,
            use_map,
        }
    }

    /// Record an executed step's output. Inside a loop the previous
    /// iteration's slot is discarded first so only the final iteration's
    /// output persists.
    pub fn record(&mut self, mut v: Map<String, Value>) {
        v.insert(STEP_RUN_KEY.to_string(), Value::Bool(true));
        self.record_raw(v);
    }

    /// Record a skipped step: `{run: false}` and nothing else.
    pub fn skip_step(&mut self) {
        let mut v = Map::new();
        v.insert(STEP_RUN_KEY.to_string(), Value::Bool(false));
        self.record_raw(v);
    }

    fn record_raw(&mut self, v: Map<String, Value>) {
        if self.use_map {
            if self.loop_index.map(|i| i > 0).unwrap_or(false) && !self.step_map.is_empty() {
                let last = self.step_keys[self.step_map.len() - 1].clone();
                self.step_map.remove(&last);
            }
            let key = self.step_keys[self.step_map.len()].clone();
            self.step_map.insert(key, Value::Object(v));
        } else {
            if self.loop_index.map(|i| i > 0).unwrap_or(false) {
                self.steps.pop();
            }
            self.steps.push(Value::Object(v));
        }
    }

    /// The most recently recorded step result.
    pub fn latest(&self) -> Option<&Value> {
        if self.use_map {
            self.step_map.values().last()
        } else {
            self.steps.last()
        }
    }

    /// The step result recorded just before the latest one.
    pub fn previous(&self) -> Option<&Value> {
        if self.use_map {
            let n = self.step_map.len();
            self.step_map.values().nth(n.checked_sub(2)?)
        } else {
            self.steps.get(self.steps.len().checked_sub(2)?)
        }
    }

    pub fn bind(&mut self, name: String, value: Value) {
        self.bind_vars.insert(name, value);
    }

    pub fn bind_vars(&self) -> &Map<String, Value> {
        &self.bind_vars
    }

    pub fn set_loop_index(&mut self, i: usize) {
        self.loop_index = Some(i);
    }

    pub fn clear_loop_index(&mut self) {
        self.loop_index = None;
    }

    pub fn loop_index(&self) -> Option<usize> {
        self.loop_index
    }

    pub fn recorded_len(&self) -> usize {
        if self.use_map {
            self.step_map.len()
        } else {
            self.steps.len()
        }
    }

    pub fn steps(&self) -> &[Value] {
        &self.steps
    }

    pub fn step_map(&self) -> &Map<String, Value> {
        &self.step_map
    }

    pub fn funcs(&self) -> &FuncMap {
        &self.funcs
    }

    /// Snapshot for the expression evaluator: `vars`, the step results,
    /// every bound variable at the root, and the loop index while a loop
    /// iteration is active.
    pub fn to_map(&self) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert(VARS_KEY.to_string(), Value::Object(self.vars.clone()));
        if self.use_map {
            m.insert(STEPS_KEY.to_string(), Value::Object(self.step_map.clone()));
        } else {
            m.insert(STEPS_KEY.to_string(), Value::Array(self.steps.clone()));
        }
        for (k, v) in &self.bind_vars {
            m.insert(k.clone(), v.clone());
        }
        if let Some(i) = self.loop_index {
            m.insert(LOOP_INDEX_KEY.to_string(), Value::from(i));
        }
        m
    }

    /// Snapshot plus an environment carrying the store's functions.
    pub fn env<'a>(&'a self, snapshot: &'a Map<String, Value>) -> Env<'a> {
        Env::with_funcs(snapshot, &self.funcs)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn records_run_flag_in_list_mode() {
        let mut s = Store::new(Map::new(), FuncMap::new(), false, vec![]);
        s.record(obj(json!({"stdout": "hi"})));
        s.skip_step();
        assert_eq!(s.steps()[0], json!({"stdout": "hi", "run": true}));
        assert_eq!(s.steps()[1], json!({"run": false}));
    }

    #[test]
    fn loop_iterations_overwrite_their_slot() {
        let mut s = Store::new(Map::new(), FuncMap::new(), false, vec![]);
        for i in 0..3 {
            s.set_loop_index(i);
            s.record(obj(json!({"attempt": i})));
        }
        s.clear_loop_index();
        assert_eq!(s.steps().len(), 1);
        assert_eq!(s.steps()[0], json!({"attempt": 2, "run": true}));
    }

    #[test]
    fn map_mode_records_under_step_keys() {
        let keys = vec!["login".to_string(), "fetch".to_string()];
        let mut s = Store::new(Map::new(), FuncMap::new(), true, keys);
        s.record(obj(json!({"res": 1})));
        for i in 0..2 {
            s.set_loop_index(i);
            s.record(obj(json!({"try": i})));
        }
        s.clear_loop_index();
        assert_eq!(s.recorded_len(), 2);
        assert_eq!(s.step_map()["login"], json!({"res": 1, "run": true}));
        assert_eq!(s.step_map()["fetch"], json!({"try": 1, "run": true}));
    }

    #[test]
    fn snapshot_merges_bind_vars_at_root() {
        let mut vars = Map::new();
        vars.insert("base".to_string(), json!("b"));
        let mut s = Store::new(vars, FuncMap::new(), false, vec![]);
        s.bind("token".to_string(), json!("abc"));
        s.record(Map::new());
        let m = s.to_map();
        assert_eq!(m["vars"], json!({"base": "b"}));
        assert_eq!(m["token"], json!("abc"));
        assert_eq!(m["steps"], json!([{"run": true}]));
        assert!(m.get("i").is_none());
        s.set_loop_index(1);
        assert_eq!(s.to_map()["i"], json!(1));
    }

    #[test]
    fn latest_and_previous_track_recording_order() {
        let mut s = Store::new(Map::new(), FuncMap::new(), false, vec![]);
        assert!(s.latest().is_none());
        s.record(obj(json!({"n": 1})));
        assert!(s.previous().is_none());
        s.record(obj(json!({"n": 2})));
        assert_eq!(s.latest().unwrap()["n"], json!(2));
        assert_eq!(s.previous().unwrap()["n"], json!(1));
    }
}
