// Scope frames for DRES-variables (locals), spec §4.1.
//
// A scope is a parent pointer plus a fixed-size array indexed by the
// local's global dresvar id; `scope_get` walks the parent chain
// returning the first set slot, or NIL. Locals may only ever hold
// NIL, INTEGER, DOUBLE, or STRING — never a factset (spec §4.1).

use std::cell::RefCell;
use std::rc::Rc;

use crate::value::Value;
use crate::vm::VmError;

pub struct Scope {
    parent: Option<Rc<Scope>>,
    slots: RefCell<Vec<Option<Value>>>,
}

impl Scope {
    pub fn new(parent: Option<Rc<Scope>>, nvars: usize) -> Scope {
        Scope {
            parent,
            slots: RefCell::new(vec![None; nvars]),
        }
    }

    fn check_local_value(v: &Value) -> Result<(), VmError> {
        match v {
            Value::Global(_) => Err(VmError::TypeError {
                expected: "scalar (nil/integer/double/string)",
                got: "global",
            }),
            _ => Ok(()),
        }
    }

    pub fn set(&self, id: usize, v: Value) -> Result<(), VmError> {
        Self::check_local_value(&v)?;
        let mut slots = self.slots.borrow_mut();
        if id >= slots.len() {
            return Err(VmError::IllegalLocal(id));
        }
        slots[id] = Some(v);
        Ok(())
    }

    pub fn get(&self, id: usize) -> Value {
        if let Some(Some(v)) = self.slots.borrow().get(id) {
            return v.clone();
        }
        match &self.parent {
            Some(p) => p.get(id),
            None => Value::Nil,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_local_reads_as_nil() {
        let s = Scope::new(None, 3);
        assert!(matches!(s.get(1), Value::Nil));
    }

    #[test]
    fn child_scope_falls_back_to_parent() {
        let parent = Rc::new(Scope::new(None, 2));
        parent.set(0, Value::Integer(7)).unwrap();
        let child = Scope::new(Some(parent), 2);
        assert_eq!(child.get(0).as_integer().unwrap(), 7);
    }

    #[test]
    fn child_scope_shadows_parent() {
        let parent = Rc::new(Scope::new(None, 1));
        parent.set(0, Value::Integer(1)).unwrap();
        let child = Scope::new(Some(parent), 1);
        child.set(0, Value::Integer(2)).unwrap();
        assert_eq!(child.get(0).as_integer().unwrap(), 2);
    }

    #[test]
    fn rejects_factset_values() {
        use crate::fact_store::MemoryFactStore;
        use crate::value::FactSet;
        let s = Scope::new(None, 1);
        let mut store = MemoryFactStore::default();
        use crate::fact_store::FactStore;
        let h = store.create("x");
        let err = s.set(0, Value::Global(FactSet::Orphan(h)));
        assert!(err.is_err());
    }
}
