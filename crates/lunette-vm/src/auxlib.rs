//! Argument-checking helpers and library-table plumbing for host code.

use crate::error::{Control, VmError};
use crate::heap::HostFn;
use crate::state::State;
use lunette_core::value::{ClosureRef, TableRef, ThreadRef, UserDataRef, Value};

impl State {
    /// "bad argument #n (msg)" with the caller's source position.
    pub fn arg_error(&self, n: usize, msg: &str) -> Control {
        self.error_where(VmError::TypeMismatch(format!("bad argument #{n} ({msg})")))
    }

    pub fn arg_check(&self, cond: bool, n: usize, msg: &str) -> Result<(), Control> {
        if cond {
            Ok(())
        } else {
            Err(self.arg_error(n, msg))
        }
    }

    fn tag_error(&self, n: usize, expected: &str) -> Control {
        self.arg_error(
            n,
            &format!("{expected} expected, got {}", self.type_name_at(n as i64)),
        )
    }

    pub fn check_any(&self, n: usize) -> Result<Value, Control> {
        if !self.is_valid(n as i64) {
            return Err(self.arg_error(n, "value expected"));
        }
        Ok(self.get(n as i64))
    }

    pub fn check_integer(&self, n: usize) -> Result<i64, Control> {
        match self.to_integer_x(n as i64) {
            Some(i) => Ok(i),
            None => {
                if self.is_number(n as i64) {
                    Err(self.arg_error(n, "number has no integer representation"))
                } else {
                    Err(self.tag_error(n, "number"))
                }
            }
        }
    }

    pub fn check_number(&self, n: usize) -> Result<f64, Control> {
        self.to_number_x(n as i64).ok_or_else(|| self.tag_error(n, "number"))
    }

    pub fn check_string(&mut self, n: usize) -> Result<Vec<u8>, Control> {
        match self.to_str_id(n as i64) {
            Some(id) => Ok(self.strings.get(id).to_vec()),
            None => Err(self.tag_error(n, "string")),
        }
    }

    pub fn check_table(&self, n: usize) -> Result<TableRef, Control> {
        match self.get(n as i64) {
            Value::Table(t) => Ok(t),
            _ => Err(self.tag_error(n, "table")),
        }
    }

    pub fn check_closure(&self, n: usize) -> Result<ClosureRef, Control> {
        match self.get(n as i64) {
            Value::Closure(c) => Ok(c),
            _ => Err(self.tag_error(n, "function")),
        }
    }

    pub fn check_userdata(&self, n: usize) -> Result<UserDataRef, Control> {
        match self.get(n as i64) {
            Value::UserData(u) => Ok(u),
            _ => Err(self.tag_error(n, "userdata")),
        }
    }

    pub fn check_thread(&self, n: usize) -> Result<ThreadRef, Control> {
        match self.get(n as i64) {
            Value::Thread(t) => Ok(t),
            _ => Err(self.tag_error(n, "thread")),
        }
    }

    /// Default when the argument is absent or nil.
    pub fn opt_integer(&self, n: usize, default: i64) -> Result<i64, Control> {
        if self.is_nil(n as i64) {
            Ok(default)
        } else {
            self.check_integer(n)
        }
    }

    pub fn opt_number(&self, n: usize, default: f64) -> Result<f64, Control> {
        if self.is_nil(n as i64) {
            Ok(default)
        } else {
            self.check_number(n)
        }
    }

    pub fn opt_string(&mut self, n: usize, default: &str) -> Result<Vec<u8>, Control> {
        if self.is_nil(n as i64) {
            Ok(default.as_bytes().to_vec())
        } else {
            self.check_string(n)
        }
    }

    /// Raise a runtime error with the caller's source position attached.
    pub fn error_msg(&self, msg: &str) -> Control {
        self.error_where(VmError::Runtime(msg.to_string()))
    }

    // ---- Library tables ----

    /// A fresh table pre-sized for the function list, left on the stack.
    pub fn new_lib_table(&mut self, n: usize) -> TableRef {
        self.create_table(0, n)
    }

    /// Create a table and populate it with the functions.
    pub fn new_lib(&mut self, l: &[(&str, HostFn)]) -> Result<TableRef, Control> {
        let t = self.new_lib_table(l.len());
        self.set_funcs(l, 0)?;
        Ok(t)
    }

    /// Assign each function into the table below the `nup` shared upvalues
    /// on top of the stack; every closure receives copies of all of them.
    /// The upvalues are popped afterwards.
    pub fn set_funcs(&mut self, l: &[(&str, HostFn)], nup: usize) -> Result<(), Control> {
        self.check_stack(nup)?;
        for &(name, f) in l {
            for _ in 0..nup {
                self.push_value(-(nup as i64));
            }
            self.push_host_closure(f, nup);
            self.set_field(-(nup as i64 + 2), name)?;
        }
        self.set_top(-(nup as i64) - 1);
        Ok(())
    }
}
