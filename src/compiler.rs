// AST-to-bytecode lowering (spec §4.5).
//
// Variable references are classified by a leading `$`: `$name` is a
// dresvar (a scalar tracked purely for dependency-graph purposes,
// stored outside the fact store — see `crate::vars::Universe`),
// anything else is a factvar (a named, possibly multi-valued, fact
// looked up in the fact store at run time). This is the one point
// where the surface syntax has to pick a lane, since the two kinds
// compile to entirely different opcodes.

use crate::ast::{Expr, Literal, Selector, Stmt, TargetDecl, VarRef};
use crate::instr::{BranchMode, Chunk, CmpOp, GetMode, Instr, PopMode, PushArg, SetMode};
use crate::vars::Universe;

pub struct Compiler<'a> {
    vars: &'a mut Universe,
}

impl<'a> Compiler<'a> {
    pub fn new(vars: &'a mut Universe) -> Compiler<'a> {
        Compiler { vars }
    }

    /// Compile one target's prerequisites and body into its `Chunk`.
    /// Prerequisites are resolved and recorded on the `Target` itself;
    /// the returned chunk is the body's executable action sequence.
    pub fn compile_target(&mut self, decl: &TargetDecl) -> Result<Chunk, String> {
        let id = self.vars.declare_target(&decl.name);
        let mut prereqs = Vec::with_capacity(decl.prereqs.len());
        for name in &decl.prereqs {
            prereqs.push(self.resolve_prereq(name));
        }
        self.vars.target_mut(id).prereqs = prereqs;

        let mut chunk = Chunk::new();
        for stmt in &decl.body {
            self.compile_stmt(&mut chunk, stmt)?;
        }
        chunk.push(Instr::Halt);
        Ok(chunk)
    }

    /// A bare name is a target prerequisite unless it's already known
    /// as a factvar, or known only by virtue of appearing in a `$`
    /// dresvar reference elsewhere. Fact/dres-variables used as a
    /// prerequisite are flagged so the resolver's change poll
    /// (`VAR_PREREQ`) knows to track them.
    fn resolve_prereq(&mut self, name: &str) -> crate::ident::Id {
        if let Some(var) = name.strip_prefix('$') {
            let id = self.vars.declare_dresvar(var);
            self.vars.dresvar_mut(id).flags.is_prereq = true;
            return id;
        }
        if let Some(id) = self.vars.factvar_by_name(name) {
            self.vars.factvar_mut(id).flags.is_prereq = true;
            return id;
        }
        if let Some(id) = self.vars.target_by_name(name) {
            return id;
        }
        self.vars.declare_target(name)
    }

    fn compile_stmt(&mut self, chunk: &mut Chunk, stmt: &Stmt) -> Result<(), String> {
        match stmt {
            Stmt::FullAssign { lvalue, rvalue } => {
                if let Some(var) = lvalue.name.strip_prefix('$') {
                    let id = self.vars.declare_dresvar(var);
                    self.compile_expr(chunk, rvalue)?;
                    chunk.push(Instr::Set(SetMode::DresVar(id.index())));
                } else {
                    self.compile_lvalue_assign(chunk, lvalue, rvalue, false)?;
                }
            }
            Stmt::PartialAssign { lvalue, rvalue } => {
                if lvalue.name.starts_with('$') {
                    return Err(format!(
                        "dresvar {} does not support partial assignment",
                        lvalue.name
                    ));
                }
                self.compile_lvalue_assign(chunk, lvalue, rvalue, true)?;
            }
            Stmt::If {
                condition,
                then_branch,
                else_branch,
            } => {
                self.compile_expr(chunk, condition)?;
                let branch_to_else = chunk.push(Instr::Branch(BranchMode::IfFalse, 0));
                for s in then_branch {
                    self.compile_stmt(chunk, s)?;
                }
                let branch_to_end = chunk.push(Instr::Branch(BranchMode::Unconditional, 0));
                let else_start = chunk.len();
                chunk.patch_branch(branch_to_else, else_start);
                for s in else_branch {
                    self.compile_stmt(chunk, s)?;
                }
                let end = chunk.len();
                chunk.patch_branch(branch_to_end, end);
            }
            Stmt::Call(name, args) => {
                self.compile_call(chunk, name, args)?;
                chunk.push(Instr::Pop(PopMode::Discard));
            }
        }
        Ok(())
    }

    /// Compile an lvalue's assignment, full or partial, per the bracket
    /// selectors it carries (spec §4.5 lvalue lowering): the rvalue
    /// first, then `PUSH GLOBAL`, then any `field:value` selectors
    /// folded into a `FILTER`, then a branch on what's left of the
    /// lvalue to decide between `UPDATE`, `SET FIELD`, and plain `SET`.
    fn compile_lvalue_assign(
        &mut self,
        chunk: &mut Chunk,
        lvalue: &VarRef,
        rvalue: &Expr,
        partial: bool,
    ) -> Result<(), String> {
        self.compile_expr(chunk, rvalue)?;

        let interned = chunk.intern(&lvalue.name);
        chunk.push(Instr::Push(PushArg::Global(interned)));

        let mut update_fields = Vec::new();
        let mut filter_count: u8 = 0;
        for selector in &lvalue.selectors {
            match selector {
                Selector::Filter(field, op, value) => {
                    let f = chunk.intern(field);
                    chunk.push(Instr::Push(PushArg::Str(f)));
                    chunk.push(Instr::Push(PushArg::Integer(op.to_tag() as i32)));
                    self.compile_literal(chunk, value);
                    filter_count += 1;
                }
                Selector::Update(field) => update_fields.push(field.clone()),
            }
        }
        if filter_count > 0 {
            chunk.push(Instr::Filter(filter_count));
        }

        if !update_fields.is_empty() {
            if lvalue.field.is_some() {
                return Err(format!(
                    "{}: update-field selectors and a trailing field access cannot be combined",
                    lvalue.name
                ));
            }
            for field in &update_fields {
                let f = chunk.intern(field);
                chunk.push(Instr::Push(PushArg::Str(f)));
            }
            chunk.push(Instr::Update(update_fields.len() as u8, partial));
        } else if partial {
            return Err(format!(
                "{}: partial assignment requires at least one update-field selector",
                lvalue.name
            ));
        } else if let Some(field) = &lvalue.field {
            let f = chunk.intern(field);
            chunk.push(Instr::Push(PushArg::Str(f)));
            chunk.push(Instr::Set(SetMode::Field));
        } else {
            chunk.push(Instr::Set(SetMode::Plain));
        }
        Ok(())
    }

    /// Push the named factset and, if any filter selectors are
    /// present, fold them into a trailing `FILTER`. Used for a plain
    /// read of `$var[...]` — an update-field selector has no meaning
    /// outside an lvalue and is rejected here.
    fn push_global_with_selectors(&mut self, chunk: &mut Chunk, v: &VarRef) -> Result<(), String> {
        let interned = chunk.intern(&v.name);
        chunk.push(Instr::Push(PushArg::Global(interned)));
        let mut filter_count: u8 = 0;
        for selector in &v.selectors {
            match selector {
                Selector::Filter(field, op, value) => {
                    let f = chunk.intern(field);
                    chunk.push(Instr::Push(PushArg::Str(f)));
                    chunk.push(Instr::Push(PushArg::Integer(op.to_tag() as i32)));
                    self.compile_literal(chunk, value);
                    filter_count += 1;
                }
                Selector::Update(field) => {
                    return Err(format!(
                        "{}: update-field selector [{}] is only valid on an assignment lvalue",
                        v.name, field
                    ))
                }
            }
        }
        if filter_count > 0 {
            chunk.push(Instr::Filter(filter_count));
        }
        Ok(())
    }

    fn compile_expr(&mut self, chunk: &mut Chunk, expr: &Expr) -> Result<(), String> {
        match expr {
            Expr::Const(lit) => self.compile_literal(chunk, lit),
            Expr::Var(v) => self.compile_varref(chunk, v)?,
            Expr::Rel(op, a, b) => {
                self.compile_expr(chunk, a)?;
                self.compile_expr(chunk, b)?;
                chunk.push(Instr::Cmp(CmpOp::Rel(*op)));
            }
            Expr::Not(a) => {
                self.compile_expr(chunk, a)?;
                chunk.push(Instr::Cmp(CmpOp::Not));
            }
            Expr::And(a, b) => {
                self.compile_expr(chunk, a)?;
                let to_false = chunk.push(Instr::Branch(BranchMode::IfFalse, 0));
                self.compile_expr(chunk, b)?;
                let to_end = chunk.push(Instr::Branch(BranchMode::Unconditional, 0));
                let false_at = chunk.push(Instr::Push(PushArg::Integer(0)));
                chunk.patch_branch(to_false, false_at);
                let end = chunk.len();
                chunk.patch_branch(to_end, end);
            }
            Expr::Or(a, b) => {
                self.compile_expr(chunk, a)?;
                let to_true = chunk.push(Instr::Branch(BranchMode::IfTrue, 0));
                self.compile_expr(chunk, b)?;
                let to_end = chunk.push(Instr::Branch(BranchMode::Unconditional, 0));
                let true_at = chunk.push(Instr::Push(PushArg::Integer(1)));
                chunk.patch_branch(to_true, true_at);
                let end = chunk.len();
                chunk.patch_branch(to_end, end);
            }
            Expr::Call(name, args) => self.compile_call(chunk, name, args)?,
            Expr::Fact(name, fields) => self.compile_fact(chunk, name, fields),
        }
        Ok(())
    }

    fn compile_literal(&mut self, chunk: &mut Chunk, lit: &Literal) {
        match lit {
            Literal::Integer(n) => chunk.push(Instr::Push(PushArg::Integer(*n))),
            Literal::Double(d) => chunk.push(Instr::Push(PushArg::Double(*d))),
            Literal::Str(s) => {
                let interned = chunk.intern(s);
                chunk.push(Instr::Push(PushArg::Str(interned)))
            }
        };
    }

    fn compile_varref(&mut self, chunk: &mut Chunk, v: &VarRef) -> Result<(), String> {
        if let Some(var) = v.name.strip_prefix('$') {
            if !v.selectors.is_empty() || v.field.is_some() {
                return Err(format!("dresvar ${} cannot take selectors or a field", var));
            }
            let id = self.vars.declare_dresvar(var);
            chunk.push(Instr::Push(PushArg::DresVar(id.index())));
            return Ok(());
        }

        self.push_global_with_selectors(chunk, v)?;
        if let Some(field) = &v.field {
            let f = chunk.intern(field);
            chunk.push(Instr::Push(PushArg::Str(f)));
            chunk.push(Instr::Get(GetMode::Field));
        }
        Ok(())
    }

    fn compile_call(&mut self, chunk: &mut Chunk, name: &str, args: &[Expr]) -> Result<(), String> {
        for arg in args {
            self.compile_expr(chunk, arg)?;
        }
        let interned = chunk.intern(name);
        chunk.push(Instr::Push(PushArg::Str(interned)));
        chunk.push(Instr::Call(args.len() as u8));
        Ok(())
    }

    fn compile_fact(&mut self, chunk: &mut Chunk, name: &str, fields: &[(String, Literal)]) {
        let interned = chunk.intern(name);
        chunk.push(Instr::Push(PushArg::Str(interned)));
        for (field, value) in fields {
            let f = chunk.intern(field);
            chunk.push(Instr::Push(PushArg::Str(f)));
            self.compile_literal(chunk, value);
        }
        chunk.push(Instr::Create(fields.len() as u8));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Literal, Selector, Stmt, TargetDecl, VarRef};
    use crate::instr::{Instr, RelOp};

    #[test]
    fn full_assign_emits_push_global_compile_rvalue_set_plain() {
        let mut vars = Universe::new();
        let mut c = Compiler::new(&mut vars);
        let decl = TargetDecl {
            name: "apply".to_string(),
            prereqs: Vec::new(),
            body: vec![Stmt::FullAssign {
                lvalue: VarRef {
                    name: "config".to_string(),
                    selectors: Vec::new(),
                    field: None,
                },
                rvalue: Expr::Fact(
                    "config".to_string(),
                    vec![("level".to_string(), Literal::Integer(3))],
                ),
            }],
        };
        let chunk = c.compile_target(&decl).unwrap();
        assert!(chunk.instrs.iter().any(|i| matches!(i, Instr::Create(1))));
        assert!(chunk
            .instrs
            .iter()
            .any(|i| matches!(i, Instr::Push(PushArg::Global(_)))));
        assert!(chunk.instrs.iter().any(|i| matches!(i, Instr::Set(SetMode::Plain))));
        assert!(!chunk.instrs.iter().any(|i| matches!(i, Instr::Pop(PopMode::Discard))));
    }

    #[test]
    fn full_assign_with_update_field_selector_emits_update() {
        let mut vars = Universe::new();
        let mut c = Compiler::new(&mut vars);
        let decl = TargetDecl {
            name: "apply".to_string(),
            prereqs: Vec::new(),
            body: vec![Stmt::FullAssign {
                lvalue: VarRef {
                    name: "inventory".to_string(),
                    selectors: vec![Selector::Update("item".to_string())],
                    field: None,
                },
                rvalue: Expr::Fact(
                    "inventory".to_string(),
                    vec![
                        ("item".to_string(), Literal::Str("apple".to_string())),
                        ("count".to_string(), Literal::Integer(3)),
                    ],
                ),
            }],
        };
        let chunk = c.compile_target(&decl).unwrap();
        assert!(chunk
            .instrs
            .iter()
            .any(|i| matches!(i, Instr::Update(1, false))));
    }

    #[test]
    fn partial_assign_without_update_field_is_rejected() {
        let mut vars = Universe::new();
        let mut c = Compiler::new(&mut vars);
        let decl = TargetDecl {
            name: "apply".to_string(),
            prereqs: Vec::new(),
            body: vec![Stmt::PartialAssign {
                lvalue: VarRef {
                    name: "inventory".to_string(),
                    selectors: vec![Selector::Filter(
                        "item".to_string(),
                        RelOp::Eq,
                        Literal::Str("apple".to_string()),
                    )],
                    field: None,
                },
                rvalue: Expr::Fact("inventory".to_string(), vec![]),
            }],
        };
        assert!(c.compile_target(&decl).is_err());
    }

    #[test]
    fn partial_assign_with_update_field_emits_update_partial() {
        let mut vars = Universe::new();
        let mut c = Compiler::new(&mut vars);
        let decl = TargetDecl {
            name: "apply".to_string(),
            prereqs: Vec::new(),
            body: vec![Stmt::PartialAssign {
                lvalue: VarRef {
                    name: "inventory".to_string(),
                    selectors: vec![Selector::Update("item".to_string())],
                    field: None,
                },
                rvalue: Expr::Fact(
                    "inventory".to_string(),
                    vec![
                        ("item".to_string(), Literal::Str("apple".to_string())),
                        ("count".to_string(), Literal::Integer(3)),
                    ],
                ),
            }],
        };
        let chunk = c.compile_target(&decl).unwrap();
        assert!(chunk
            .instrs
            .iter()
            .any(|i| matches!(i, Instr::Update(1, true))));
    }

    #[test]
    fn dresvar_assignment_compiles_to_set_dresvar() {
        let mut vars = Universe::new();
        let mut c = Compiler::new(&mut vars);
        let decl = TargetDecl {
            name: "t".to_string(),
            prereqs: Vec::new(),
            body: vec![Stmt::FullAssign {
                lvalue: VarRef {
                    name: "$count".to_string(),
                    selectors: Vec::new(),
                    field: None,
                },
                rvalue: Expr::Const(Literal::Integer(1)),
            }],
        };
        let chunk = c.compile_target(&decl).unwrap();
        assert!(chunk
            .instrs
            .iter()
            .any(|i| matches!(i, Instr::Set(SetMode::DresVar(_)))));
    }

    #[test]
    fn if_branches_patch_to_distinct_targets() {
        let mut vars = Universe::new();
        let mut c = Compiler::new(&mut vars);
        let decl = TargetDecl {
            name: "t".to_string(),
            prereqs: Vec::new(),
            body: vec![Stmt::If {
                condition: Expr::Const(Literal::Integer(1)),
                then_branch: vec![Stmt::Call("echo".to_string(), vec![])],
                else_branch: vec![Stmt::Call("fail".to_string(), vec![])],
            }],
        };
        let chunk = c.compile_target(&decl).unwrap();
        match chunk.instrs[1] {
            Instr::Branch(BranchMode::IfFalse, disp) => assert!(disp > 0),
            _ => panic!("expected a branch at index 1"),
        }
    }

    #[test]
    fn selector_uses_are_folded_into_filter() {
        let mut vars = Universe::new();
        let mut c = Compiler::new(&mut vars);
        let decl = TargetDecl {
            name: "t".to_string(),
            prereqs: Vec::new(),
            body: vec![Stmt::Call(
                "echo".to_string(),
                vec![Expr::Var(VarRef {
                    name: "item".to_string(),
                    selectors: vec![Selector::Filter(
                        "id".to_string(),
                        RelOp::Eq,
                        Literal::Integer(1),
                    )],
                    field: None,
                })],
            )],
        };
        let chunk = c.compile_target(&decl).unwrap();
        assert!(chunk.instrs.iter().any(|i| matches!(i, Instr::Filter(1))));
    }
}
