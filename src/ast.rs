// Abstract syntax (spec §3-4): the parsed, not-yet-compiled form of a
// policy file. Frozen once `finalize()` has lowered every target's
// statements to bytecode; the tree itself is dropped after compiling
// (spec §3 Lifecycle) — nothing downstream of `crate::compiler` holds
// onto `ast::*` types.

use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::instr::RelOp;

pub type Node<T> = Rc<T>;

/// One entry of a `$var[...]` bracket list (spec §4.1). A bracket
/// entry either narrows the variable's factset (`field:value`, any of
/// the six relational operators) or names a join key for `UPDATE`
/// (a bare field, no value).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Selector {
    Filter(String, RelOp, Literal),
    Update(String),
}

/// A literal constant (spec §3 value union, restricted to the scalar cases).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Integer(i32),
    Double(f64),
    Str(String),
}

/// `$var[field:value, ...]:field` — a reference to a global or local,
/// optionally narrowed by selectors and/or a trailing field access.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VarRef {
    pub name: String,
    #[serde(default)]
    pub selectors: Vec<Selector>,
    #[serde(default)]
    pub field: Option<String>,
}

/// An expression (spec §4.5 lowering target).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Const(Literal),
    Var(VarRef),
    Rel(RelOp, Node<Expr>, Node<Expr>),
    And(Node<Expr>, Node<Expr>),
    Or(Node<Expr>, Node<Expr>),
    Not(Node<Expr>),
    /// `name(args...)`, a method call used as a value.
    Call(String, Vec<Expr>),
    /// `name(field:value, ..., "", ...)`: multi-fact construction.
    Fact(String, Vec<(String, Literal)>),
}

/// A statement inside a target body (spec §3 `dres_stmt_u`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    /// `lvalue = rvalue` — replaces the destination's matching facts wholesale.
    FullAssign { lvalue: VarRef, rvalue: Expr },
    /// `lvalue += rvalue` — merges only the fields rvalue defines.
    PartialAssign { lvalue: VarRef, rvalue: Expr },
    If {
        condition: Expr,
        #[serde(default)]
        then_branch: Vec<Stmt>,
        #[serde(default)]
        else_branch: Vec<Stmt>,
    },
    /// A call used for its side effect, result discarded.
    Call(String, Vec<Expr>),
}

/// One `target name { prereq, ...; stmt; ... }` declaration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetDecl {
    pub name: String,
    #[serde(default)]
    pub prereqs: Vec<String>,
    #[serde(default)]
    pub body: Vec<Stmt>,
}

/// A whole parsed policy file: a flat list of target declarations plus
/// top-level variable initializers (spec §3 `dres_initializer_t`).
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub targets: Vec<TargetDecl>,
    #[serde(default)]
    pub initializers: Vec<(String, Vec<(String, Literal)>)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varref_with_no_selectors_or_field_is_a_bare_name() {
        let v = VarRef {
            name: "foo".to_string(),
            selectors: Vec::new(),
            field: None,
        };
        assert!(v.selectors.is_empty());
        assert!(v.field.is_none());
    }
}
