// File: src/compiler.rs
//
// Single-pass AST-to-bytecode compiler (spec §4.3, component C3). Tracks a
// stack of lexical scopes that mirrors the VM's runtime environment-frame
// stack one-to-one, so a name's compile-time depth (how many frames up from
// the currently executing frame) is exactly the depth the VM will walk at
// runtime — no separate resolution pass, no symbol table handed to the VM.

use crate::ast::{Expr, MapKey, Stmt, StmtNode, Token};
use crate::bytecode::{Chunk, Constant, OpCode};
use crate::errors::PyleError;

struct Scope {
    // name -> is_const
    names: std::collections::HashMap<String, bool>,
}

struct LoopCtx {
    start_ip: usize,
    scope_depth_at_entry: usize,
    break_jumps: Vec<usize>,
    is_for_in: bool,
}

pub struct Compiler {
    chunk: Chunk,
    scopes: Vec<Scope>,
    loops: Vec<LoopCtx>,
}

type CResult<T> = Result<T, PyleError>;

impl Compiler {
    pub fn new() -> Self {
        Self { chunk: Chunk::new(), scopes: Vec::new(), loops: Vec::new() }
    }

    pub fn compile_program(stmts: &[StmtNode]) -> CResult<Chunk> {
        let mut compiler = Compiler::new();
        for stmt in stmts {
            compiler.compile_stmt(stmt)?;
        }
        compiler.chunk.emit(OpCode::Halt, stmts.last().map(|s| s.token.clone()).unwrap_or_else(Token::unknown));
        Ok(compiler.chunk)
    }

    fn is_global_scope(&self) -> bool {
        self.scopes.is_empty()
    }

    fn push_scope(&mut self) {
        self.scopes.push(Scope { names: std::collections::HashMap::new() });
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    /// Resolves a name to `(depth, is_const)` by walking scopes innermost
    /// first; `None` means the name is not a local/upvalue and must be a
    /// global (spec §4.4's three-branch local/upvalue/global algorithm —
    /// the local-vs-upvalue distinction is just `depth == 0` vs `depth > 0`
    /// at this single opcode).
    fn resolve(&self, name: &str) -> Option<(usize, bool)> {
        for (i, scope) in self.scopes.iter().enumerate().rev() {
            if let Some(&is_const) = scope.names.get(name) {
                let depth = self.scopes.len() - 1 - i;
                return Some((depth, is_const));
            }
        }
        None
    }

    fn declare(&mut self, name: &str, is_const: bool, token: Token) {
        if self.is_global_scope() {
            let op = if is_const { OpCode::DefConstGlobal(name.to_string()) } else { OpCode::DefGlobal(name.to_string()) };
            self.chunk.emit(op, token);
        } else {
            self.scopes.last_mut().unwrap().names.insert(name.to_string(), is_const);
            let op = if is_const { OpCode::DefConstLocal(name.to_string()) } else { OpCode::DefLocal(name.to_string()) };
            self.chunk.emit(op, token);
        }
    }

    fn emit_get(&mut self, name: &str, token: Token) {
        match self.resolve(name) {
            Some((depth, _)) => self.chunk.emit(OpCode::GetLocal(depth, name.to_string()), token),
            None => self.chunk.emit(OpCode::GetGlobal(name.to_string()), token),
        };
    }

    fn emit_set(&mut self, name: &str, token: Token) -> CResult<()> {
        match self.resolve(name) {
            Some((_, true)) => {
                return Err(PyleError::syntactic(
                    format!("cannot assign to const '{}'", name),
                    token_loc(&token),
                ))
            }
            Some((depth, false)) => {
                self.chunk.emit(OpCode::SetLocal(depth, name.to_string()), token);
            }
            None => {
                self.chunk.emit(OpCode::SetGlobal(name.to_string()), token);
            }
        }
        Ok(())
    }

    fn compile_block(&mut self, stmts: &[StmtNode], token: Token) -> CResult<()> {
        self.chunk.emit(OpCode::EnterScope, token.clone());
        self.push_scope();
        for stmt in stmts {
            self.compile_stmt(stmt)?;
        }
        self.pop_scope();
        self.chunk.emit(OpCode::ExitScope, token);
        Ok(())
    }

    fn compile_stmt(&mut self, stmt: &StmtNode) -> CResult<()> {
        let token = stmt.token.clone();
        match &stmt.kind {
            Stmt::Block(stmts) => self.compile_block(stmts, token)?,
            Stmt::VarDecl { names, initializer, is_const, .. } => {
                self.compile_expr(initializer)?;
                if names.len() == 1 {
                    self.declare(&names[0], *is_const, token);
                } else {
                    self.chunk.emit(OpCode::Unpack(names.len()), token.clone());
                    for name in names {
                        self.declare(name, *is_const, token.clone());
                    }
                }
            }
            Stmt::Assign { name, value } => {
                self.compile_expr(value)?;
                self.emit_set(name, token)?;
            }
            Stmt::CompoundAssign { name, op, value } => {
                self.emit_get(name, token.clone());
                self.compile_expr(value)?;
                let inplace = match op.as_str() {
                    "+" => OpCode::InplaceAdd,
                    "-" => OpCode::InplaceSubtract,
                    "*" => OpCode::InplaceMultiply,
                    "/" => OpCode::InplaceDivide,
                    "%" => OpCode::InplaceModulo,
                    other => return Err(PyleError::syntactic(format!("unknown compound operator '{}'", other), token_loc(&token))),
                };
                self.chunk.emit(inplace, token.clone());
                self.emit_set(name, token)?;
            }
            Stmt::IndexAssign { collection, index, value } => {
                self.compile_expr(collection)?;
                self.compile_expr(index)?;
                self.compile_expr(value)?;
                self.chunk.emit(OpCode::IndexSet, token);
            }
            Stmt::SetAttr { obj, attr, value } => {
                self.compile_expr(obj)?;
                self.compile_expr(value)?;
                self.chunk.emit(OpCode::SetAttr(attr.clone()), token);
            }
            Stmt::If { condition, then_branch, else_branch } => {
                self.compile_expr(condition)?;
                let else_jump = self.chunk.emit(OpCode::JumpIfFalse(-1), token.clone());
                self.compile_block(then_branch, token.clone())?;
                if let Some(else_body) = else_branch {
                    let end_jump = self.chunk.emit(OpCode::Jump(-1), token.clone());
                    self.chunk.patch_jump(else_jump);
                    self.compile_block(else_body, token)?;
                    self.chunk.patch_jump(end_jump);
                } else {
                    self.chunk.patch_jump(else_jump);
                }
            }
            Stmt::While { condition, body } => {
                let start_ip = self.chunk.current_ip();
                self.compile_expr(condition)?;
                let exit_jump = self.chunk.emit(OpCode::JumpIfFalse(-1), token.clone());
                self.loops.push(LoopCtx {
                    start_ip,
                    scope_depth_at_entry: self.scopes.len(),
                    break_jumps: Vec::new(),
                    is_for_in: false,
                });
                self.compile_block(body, token.clone())?;
                self.emit_back_jump(start_ip, token.clone());
                self.chunk.patch_jump(exit_jump);
                let ctx = self.loops.pop().unwrap();
                for j in ctx.break_jumps {
                    self.chunk.patch_jump(j);
                }
            }
            Stmt::ForIn { loop_var, iterable, body } => {
                self.compile_expr(iterable)?;
                self.chunk.emit(OpCode::IterNew, token.clone());
                let start_ip = self.chunk.current_ip();
                let exit_jump = self.chunk.emit(OpCode::IterNextOrJump(-1), token.clone());
                self.chunk.emit(OpCode::EnterScope, token.clone());
                self.push_scope();
                self.declare(loop_var, false, token.clone());
                self.loops.push(LoopCtx {
                    start_ip,
                    scope_depth_at_entry: self.scopes.len(),
                    break_jumps: Vec::new(),
                    is_for_in: true,
                });
                for s in body {
                    self.compile_stmt(s)?;
                }
                let ctx = self.loops.pop().unwrap();
                self.pop_scope();
                self.chunk.emit(OpCode::ExitScope, token.clone());
                self.emit_back_jump(start_ip, token.clone());
                self.chunk.patch_jump(exit_jump);
                for j in ctx.break_jumps {
                    self.chunk.patch_jump(j);
                }
            }
            Stmt::FunctionDef { name, params, body, .. } => {
                self.compile_function(Some(name), params, body, token.clone())?;
                self.declare(name, false, token);
            }
            Stmt::Return(expr) => {
                match expr {
                    Some(e) => self.compile_expr(e)?,
                    None => {
                        self.chunk.emit(OpCode::PushNull, token.clone());
                    }
                }
                self.chunk.emit(OpCode::Return, token);
            }
            Stmt::Break => {
                let ctx = self
                    .loops
                    .last()
                    .ok_or_else(|| PyleError::syntactic("'break' outside of a loop", token_loc(&token)))?;
                let unwind = self.scopes.len() - ctx.scope_depth_at_entry + if ctx.is_for_in { 1 } else { 0 };
                let is_for_in = ctx.is_for_in;
                for _ in 0..unwind {
                    self.chunk.emit(OpCode::ExitScope, token.clone());
                }
                if is_for_in {
                    // the iterator pushed by `IterNew` is still on the stack
                    // when jumping out directly, unlike the exhaustion path
                    // which pops it as part of `IterNextOrJump`.
                    self.chunk.emit(OpCode::Pop, token.clone());
                }
                let jump = self.chunk.emit(OpCode::Jump(-1), token);
                self.loops.last_mut().unwrap().break_jumps.push(jump);
            }
            Stmt::Continue => {
                let ctx = self
                    .loops
                    .last()
                    .ok_or_else(|| PyleError::syntactic("'continue' outside of a loop", token_loc(&token)))?;
                let unwind = self.scopes.len() - ctx.scope_depth_at_entry;
                let start_ip = ctx.start_ip;
                let is_for_in = ctx.is_for_in;
                for _ in 0..unwind {
                    self.chunk.emit(OpCode::ExitScope, token.clone());
                }
                if is_for_in {
                    // the loop body's own ExitScope/back-jump sequence is
                    // skipped, so continue must replicate it here.
                    self.chunk.emit(OpCode::ExitScope, token.clone());
                }
                self.emit_back_jump(start_ip, token);
            }
            Stmt::Use { path, alias } => {
                self.chunk.emit(OpCode::Use(path.clone(), alias.clone()), token.clone());
                let bound_name = alias.clone().unwrap_or_else(|| path.last().cloned().unwrap());
                self.declare(&bound_name, true, token);
            }
            Stmt::ExprStmt(e) => {
                self.compile_expr(e)?;
                self.chunk.emit(OpCode::Pop, token);
            }
        }
        Ok(())
    }

    fn emit_back_jump(&mut self, target_ip: usize, token: Token) {
        let ip = self.chunk.emit(OpCode::Jump(-1), token);
        let offset = target_ip as isize - (ip as isize + 1);
        if let OpCode::Jump(o) = &mut self.chunk.code[ip].op {
            *o = offset;
        }
    }

    /// Compiles a function body as a detached region of the single chunk:
    /// a `Jump` hops over the body at the definition site, the body itself
    /// starts right after, and a closure value capturing the currently
    /// open frames is pushed (spec §4.3).
    fn compile_function(&mut self, name: Option<&str>, params: &[String], body: &[StmtNode], token: Token) -> CResult<()> {
        let capture_depth = self.scopes.len();
        let skip_jump = self.chunk.emit(OpCode::Jump(-1), token.clone());
        let entry_ip = self.chunk.current_ip();

        // `break`/`continue` never cross a function boundary — a loop in
        // an enclosing body is not reachable control flow from inside a
        // nested function (it would need to unwind scopes and jump to an
        // IP in bytecode this call never returns through).
        let outer_loops = std::mem::take(&mut self.loops);

        self.push_scope();
        for p in params {
            self.scopes.last_mut().unwrap().names.insert(p.clone(), false);
            self.chunk.emit(OpCode::DefLocal(p.clone()), token.clone());
        }

        // A leading bare string literal is a docstring: captured into the
        // function's `doc` rather than compiled as a (no-op) expression
        // statement.
        let doc = match body.first() {
            Some(StmtNode { kind: Stmt::ExprStmt(expr), .. }) => match &expr.kind {
                Expr::String(s) => Some(s.clone()),
                _ => None,
            },
            _ => None,
        };
        let rest = if doc.is_some() { &body[1..] } else { body };

        for s in rest {
            self.compile_stmt(s)?;
        }
        // implicit `return null` if control falls off the end of the body.
        self.chunk.emit(OpCode::PushNull, token.clone());
        self.chunk.emit(OpCode::Return, token.clone());
        self.pop_scope();

        self.loops = outer_loops;

        self.chunk.patch_jump(skip_jump);

        let proto = Constant::FunctionProto {
            name: name.unwrap_or("<anonymous>").to_string(),
            arity: params.len(),
            entry_ip,
            capture_depth,
            doc,
        };
        let const_idx = self.chunk.add_constant(proto);
        self.chunk.emit(OpCode::MakeClosure { proto_const: const_idx, capture_depth }, token);
        Ok(())
    }

    fn compile_expr(&mut self, expr: &crate::ast::ExprNode) -> CResult<()> {
        let token = expr.token.clone();
        match &expr.kind {
            Expr::Variable(name) => self.emit_get(name, token),
            Expr::Number(n, is_int) => {
                let c = if *is_int { Constant::Int(*n as i64) } else { Constant::Float(*n) };
                let idx = self.chunk.add_constant(c);
                self.chunk.emit(OpCode::Const(idx), token);
            }
            Expr::String(s) => {
                let idx = self.chunk.add_constant(Constant::Str(s.clone()));
                self.chunk.emit(OpCode::Const(idx), token);
            }
            Expr::Bool(b) => {
                self.chunk.emit(OpCode::PushBool(*b), token);
            }
            Expr::Null => {
                self.chunk.emit(OpCode::PushNull, token);
            }
            Expr::Array(items) => {
                for item in items {
                    self.compile_expr(item)?;
                }
                self.chunk.emit(OpCode::BuildList(items.len()), token);
            }
            Expr::Tuple(items) => {
                for item in items {
                    self.compile_expr(item)?;
                }
                self.chunk.emit(OpCode::BuildTuple(items.len()), token);
            }
            Expr::Map(props) => {
                for prop in props {
                    match &prop.key {
                        MapKey::Name(n) => {
                            let idx = self.chunk.add_constant(Constant::Str(n.clone()));
                            self.chunk.emit(OpCode::Const(idx), token.clone());
                        }
                        MapKey::Computed(e) => self.compile_expr(e)?,
                    }
                    self.compile_expr(&prop.value)?;
                }
                self.chunk.emit(OpCode::BuildMap(props.len()), token);
            }
            Expr::Range { start, end, step } => {
                self.compile_expr(start)?;
                self.compile_expr(end)?;
                let has_step = step.is_some();
                if let Some(s) = step {
                    self.compile_expr(s)?;
                }
                self.chunk.emit(OpCode::BuildRange { has_step }, token);
            }
            Expr::BinaryOp { left, op, right } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                let opcode = match op.as_str() {
                    "+" => OpCode::Add,
                    "-" => OpCode::Subtract,
                    "*" => OpCode::Multiply,
                    "/" => OpCode::Divide,
                    "%" => OpCode::Modulo,
                    other => return Err(PyleError::syntactic(format!("unknown operator '{}'", other), token_loc(&token))),
                };
                self.chunk.emit(opcode, token);
            }
            Expr::ComparisonOp { left, op, right } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                let opcode = match op.as_str() {
                    "==" => OpCode::Equal,
                    "!=" => OpCode::NotEqual,
                    "<" => OpCode::Less,
                    "<=" => OpCode::LessEqual,
                    ">" => OpCode::Greater,
                    ">=" => OpCode::GreaterEqual,
                    other => return Err(PyleError::syntactic(format!("unknown comparison '{}'", other), token_loc(&token))),
                };
                self.chunk.emit(opcode, token);
            }
            Expr::LogicalOp { left, op, right } => {
                self.compile_expr(left)?;
                self.chunk.emit(OpCode::Dup, token.clone());
                let short_circuit = match op.as_str() {
                    "&&" => self.chunk.emit(OpCode::JumpIfFalse(-1), token.clone()),
                    "||" => self.chunk.emit(OpCode::JumpIfTrue(-1), token.clone()),
                    other => return Err(PyleError::syntactic(format!("unknown logical operator '{}'", other), token_loc(&token))),
                };
                self.chunk.emit(OpCode::Pop, token.clone());
                self.compile_expr(right)?;
                self.chunk.patch_jump(short_circuit);
            }
            Expr::UnaryOp { op, operand } => {
                self.compile_expr(operand)?;
                match op.as_str() {
                    "-" => {
                        self.chunk.emit(OpCode::Negate, token);
                    }
                    "!" => {
                        self.chunk.emit(OpCode::Not, token);
                    }
                    "unwrap" => {
                        self.chunk.emit(OpCode::Unwrap, token);
                    }
                    "try" => {
                        self.chunk.emit(OpCode::UnwrapOrReturn, token);
                    }
                    other => return Err(PyleError::syntactic(format!("unknown unary operator '{}'", other), token_loc(&token))),
                }
            }
            Expr::Call { callee, args } => {
                self.compile_expr(callee)?;
                for a in args {
                    self.compile_expr(a)?;
                }
                self.chunk.emit(OpCode::Call(args.len()), token);
            }
            Expr::Index { collection, index } => {
                self.compile_expr(collection)?;
                self.compile_expr(index)?;
                self.chunk.emit(OpCode::IndexGet, token);
            }
            Expr::Dot { obj, attr } => {
                self.compile_expr(obj)?;
                self.chunk.emit(OpCode::GetAttr(attr.clone()), token);
            }
            Expr::FunctionExpr { params, body, .. } => {
                self.compile_function(None, params, body, token)?;
            }
        }
        Ok(())
    }
}

fn token_loc(token: &Token) -> crate::errors::SourceLocation {
    crate::errors::SourceLocation::with_file(token.line, token.col_start, token.file.clone())
}

pub fn compile(stmts: &[StmtNode]) -> CResult<Chunk> {
    Compiler::compile_program(stmts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::parser::parse;

    fn compile_src(src: &str) -> Chunk {
        let tokens = tokenize(src, "t.pyle").unwrap();
        let stmts = parse(tokens, "t.pyle").unwrap();
        compile(&stmts).unwrap()
    }

    #[test]
    fn compiles_global_let_to_def_global() {
        let chunk = compile_src("let x = 1");
        assert!(chunk.code.iter().any(|i| matches!(i.op, OpCode::DefGlobal(ref n) if n == "x")));
    }

    #[test]
    fn compiles_local_let_inside_block_to_def_local() {
        let chunk = compile_src("if true { let x = 1 }");
        assert!(chunk.code.iter().any(|i| matches!(i.op, OpCode::DefLocal(ref n) if n == "x")));
    }

    #[test]
    fn short_circuit_and_uses_dup_and_jump_if_false() {
        let chunk = compile_src("let x = true && false");
        let ops: Vec<&OpCode> = chunk.code.iter().map(|i| &i.op).collect();
        assert!(ops.iter().any(|o| matches!(o, OpCode::Dup)));
        assert!(ops.iter().any(|o| matches!(o, OpCode::JumpIfFalse(_))));
    }

    #[test]
    fn function_def_emits_jump_over_body_and_make_closure() {
        let chunk = compile_src("fn f(x) { return x }");
        let ops: Vec<&OpCode> = chunk.code.iter().map(|i| &i.op).collect();
        assert!(matches!(ops[0], OpCode::Jump(_)));
        assert!(ops.iter().any(|o| matches!(o, OpCode::MakeClosure { .. })));
    }

    #[test]
    fn break_unwinds_for_in_loop_scope_before_jumping() {
        let chunk = compile_src("for i in 0..3 { break }");
        let break_jump_idx = chunk
            .code
            .iter()
            .position(|i| matches!(i.op, OpCode::ExitScope))
            .unwrap();
        assert!(matches!(chunk.code[break_jump_idx].op, OpCode::ExitScope));
    }
}
