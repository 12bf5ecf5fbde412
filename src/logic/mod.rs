//! Cyclic logic program: a newline separated block of assignments evaluated
//! once per scan cycle against the current tag values.
//!
//! Each line has the shape `<tag> = <expression>[,delay:<cycles>]`. The
//! optional delay holds a changed result back for `cycles * cycle-time`
//! milliseconds before the update is queued.

pub mod expr;

use crate::tags::TagManager;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;

pub struct LogicModule {
    manager: Arc<TagManager>,
    /// Program text as configured
    source: String,
    /// Program text with the current cycle's tag values substituted in
    current: String,
    /// Remaining hold time in milliseconds per delayed tag
    delayed: HashMap<String, i64>,
}

impl LogicModule {
    pub fn new(manager: Arc<TagManager>, source: &str) -> Self {
        Self {
            manager,
            source: source.trim().to_string(),
            current: String::new(),
            delayed: HashMap::new(),
        }
    }

    /// Substitutes the current value of every classified tag into the right
    /// hand side of each line. Longest tags substitute first so that a tag
    /// name never clobbers another tag it is a prefix of.
    pub fn scan_inputs(&mut self) {
        self.current = self.source.clone();
        for tag in sorted_by_length(self.manager.binary_tags()) {
            let status = self.manager.get_data_by_tag::<bool>(&tag);
            let literal = if status { "True" } else { "False" };
            self.current = replace_all_rhs(&self.current, &tag, literal);
        }
        for tag in sorted_by_length(self.manager.analog_tags()) {
            let value = self.manager.get_data_by_tag::<f64>(&tag);
            self.current = replace_all_rhs(&self.current, &tag, &value.to_string());
        }
    }

    /// Evaluates every line of the substituted program, queueing changed
    /// results into the pending update maps. Lines that fail to parse are
    /// skipped; the rest of the program still runs.
    pub fn scan_logic(&mut self, cycle_time_ms: u64) {
        let lines: Vec<String> = self
            .current
            .lines()
            .map(|line| line.trim().to_string())
            .collect();
        for line in lines {
            if line.is_empty() {
                continue;
            }

            let (lhs, rhs) = match line.split_once('=') {
                Some((lhs, rhs)) => (lhs.trim().to_string(), rhs.trim().to_string()),
                None => {
                    error!("[ {} ] logic line has no assignment", line);
                    continue;
                }
            };

            let (logic, delay) = split_delay(&rhs);

            // A tag already being delayed keeps counting down and skips
            // re-evaluation until its hold time runs out
            if let Some(remaining) = self.delayed.get(&lhs).copied() {
                let remaining = remaining - cycle_time_ms as i64;
                if remaining > 0 {
                    self.delayed.insert(lhs.clone(), remaining);
                    debug!(
                        "LOGIC ({}): {} = {} ----> [ DELAYED {}ms ]",
                        delay, lhs, logic, remaining
                    );
                    continue;
                }
            }

            let value = match expr::evaluate(&logic) {
                Ok(value) => value,
                Err(err) => {
                    error!("[ {} ] failed to parse logic: {}", logic, err);
                    continue;
                }
            };

            if self.manager.is_binary(&lhs) {
                let result = value.as_bool();
                debug!("LOGIC ({}): {} = {} ----> {}", delay, lhs, logic, result);
                if result != self.manager.get_data_by_tag::<bool>(&lhs)
                    && !self.manager.is_updated_binary(&lhs)
                {
                    if delay > 0 && !self.delayed.contains_key(&lhs) {
                        let hold = delay * cycle_time_ms as i64;
                        self.delayed.insert(lhs.clone(), hold);
                        info!("delaying tag {} for {}ms", lhs, hold);
                    } else {
                        self.manager.add_updated_binary(&lhs, result);
                        self.delayed.remove(&lhs);
                    }
                } else if self.delayed.contains_key(&lhs) {
                    self.delayed.remove(&lhs);
                }
            } else if self.manager.is_analog(&lhs) {
                let result = value.as_number();
                debug!("LOGIC ({}): {} = {} ----> {}", delay, lhs, logic, result);
                if result != self.manager.get_data_by_tag::<f64>(&lhs)
                    && !self.manager.is_updated_analog(&lhs)
                {
                    if delay > 0 && !self.delayed.contains_key(&lhs) {
                        let hold = delay * cycle_time_ms as i64;
                        self.delayed.insert(lhs.clone(), hold);
                        info!("delaying tag {} for {}ms", lhs, hold);
                    } else {
                        self.manager.add_updated_analog(&lhs, result);
                        self.delayed.remove(&lhs);
                    }
                } else if self.delayed.contains_key(&lhs) {
                    self.delayed.remove(&lhs);
                }
            }
        }
    }

    #[cfg(test)]
    fn delayed_remaining(&self, tag: &str) -> Option<i64> {
        self.delayed.get(tag).copied()
    }
}

/// Splits `<expression>[,delay:N]`, clamping negative or malformed delay
/// counts to zero.
fn split_delay(rhs: &str) -> (String, i64) {
    let parts: Vec<&str> = rhs.split(',').collect();
    let logic = parts[0].trim().to_string();
    let mut delay = 0;
    if parts.len() == 2 {
        let suffix: Vec<&str> = parts[1].split(':').collect();
        if suffix.len() == 2 && suffix[0].trim() == "delay" {
            match suffix[1].trim().parse::<i64>() {
                Ok(value) => delay = value.max(0),
                Err(err) => {
                    error!("invalid delay in logic, setting delay to 0: {}", err);
                }
            }
        } else {
            warn!("delay logic error, setting delay to 0");
        }
    } else if parts.len() > 2 {
        error!("check logic...too many pieces detected");
    }
    (logic, delay)
}

fn sorted_by_length(mut tags: Vec<String>) -> Vec<String> {
    tags.sort_by(|a, b| b.len().cmp(&a.len()));
    tags
}

/// Replaces every right hand side occurrence of `tag` with `literal`. An
/// occurrence at the start of a line is the assignment target and is left
/// alone, as is any occurrence followed by an alphanumeric character (a
/// longer tag name this one is a prefix of).
fn replace_all_rhs(program: &str, tag: &str, literal: &str) -> String {
    let mut replaced = String::with_capacity(program.len());
    for line in program.lines() {
        let mut line = line.trim().to_string();
        let mut search = 0;
        while let Some(offset) = line[search..].find(tag) {
            let position = search + offset;
            let end = position + tag.len();
            let boundary = match line[end..].chars().next() {
                Some(next) => !next.is_alphanumeric(),
                None => true,
            };
            if position != 0 && boundary {
                line.replace_range(position..end, literal);
                search = position + literal.len();
            } else {
                search = end;
            }
        }
        replaced.push_str(&line);
        replaced.push('\n');
    }
    replaced
}

#[cfg(test)]
mod test {
    use super::{replace_all_rhs, LogicModule};
    use crate::tags::TagManager;
    use std::sync::Arc;

    fn manager() -> Arc<TagManager> {
        Arc::new(TagManager::new())
    }

    #[test]
    fn test_rhs_substitution_respects_boundaries() {
        let program = "var_O1 = var_O0\nout = var_O0 + var_O01\n";
        let replaced = replace_all_rhs(program, "var_O0", "True");
        assert_eq!(replaced, "var_O1 = True\nout = True + var_O01\n");
    }

    #[test]
    fn test_basic_assignment_settles() {
        let manager = manager();
        manager.add_internal_data("foo", false);
        manager.add_binary_tag("foo");

        let mut logic = LogicModule::new(manager.clone(), "foo = True");
        logic.scan_inputs();
        logic.scan_logic(1000);
        manager.update_internal_data();
        manager.clear_updated_tags();
        assert!(manager.get_data_by_tag::<bool>("foo"));

        // Once settled the value no longer produces a pending update
        logic.scan_inputs();
        logic.scan_logic(1000);
        assert!(!manager.is_updated_binary("foo"));
    }

    #[test]
    fn test_delay_holds_update_for_configured_cycles() {
        let manager = manager();
        manager.add_internal_data("a", false);
        manager.add_internal_data("b", false);
        manager.add_binary_tag("a");
        manager.add_binary_tag("b");

        let mut logic = LogicModule::new(manager.clone(), "a = b,delay:3");

        let mut cycle = |logic: &mut LogicModule| {
            logic.scan_inputs();
            logic.scan_logic(1000);
            manager.update_internal_data();
            manager.clear_updated_tags();
        };

        // b flips before the first cycle runs
        manager.add_updated_binary("b", true);
        manager.update_internal_data();
        manager.clear_updated_tags();

        cycle(&mut logic); // change noticed, hold begins at 3000ms
        assert!(!manager.get_data_by_tag::<bool>("a"));
        assert_eq!(logic.delayed_remaining("a"), Some(3000));

        cycle(&mut logic);
        assert!(!manager.get_data_by_tag::<bool>("a"));
        assert_eq!(logic.delayed_remaining("a"), Some(2000));

        cycle(&mut logic);
        assert!(!manager.get_data_by_tag::<bool>("a"));
        assert_eq!(logic.delayed_remaining("a"), Some(1000));

        cycle(&mut logic); // hold expired, update applies this cycle
        assert!(manager.get_data_by_tag::<bool>("a"));
        assert_eq!(logic.delayed_remaining("a"), None);
    }

    #[test]
    fn test_delay_cleared_when_value_settles_back() {
        let manager = manager();
        manager.add_internal_data("a", false);
        manager.add_internal_data("b", false);
        manager.add_binary_tag("a");
        manager.add_binary_tag("b");

        let mut logic = LogicModule::new(manager.clone(), "a = b,delay:2");

        manager.add_updated_binary("b", true);
        manager.update_internal_data();
        manager.clear_updated_tags();

        logic.scan_inputs();
        logic.scan_logic(1000);
        assert_eq!(logic.delayed_remaining("a"), Some(2000));

        // b reverts while the hold is counting down
        manager.add_updated_binary("b", false);
        manager.update_internal_data();
        manager.clear_updated_tags();

        // Still counting, evaluation is skipped
        logic.scan_inputs();
        logic.scan_logic(1000);
        assert_eq!(logic.delayed_remaining("a"), Some(1000));

        // Hold expires, evaluation sees the settled value and abandons
        // the delay without queueing an update
        logic.scan_inputs();
        logic.scan_logic(1000);
        assert_eq!(logic.delayed_remaining("a"), None);
        assert!(!manager.is_updated_binary("a"));
        assert!(!manager.get_data_by_tag::<bool>("a"));
    }

    #[test]
    fn test_bad_line_does_not_stop_program() {
        let manager = manager();
        manager.add_internal_data("ok", 0.0);
        manager.add_analog_tag("ok");

        let mut logic = LogicModule::new(manager.clone(), "broken = ) + 1\nok = 4 * 2");
        logic.scan_inputs();
        logic.scan_logic(1000);
        manager.update_internal_data();
        assert_eq!(manager.get_data_by_tag::<f64>("ok"), 8.0);
    }
}
