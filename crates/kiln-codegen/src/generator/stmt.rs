//! Statement emission.

use kiln_core::bound::{CatchClause, Expr, Stmt, StmtKind};
use kiln_core::symbols::{LabelId, LocalKind, LocalSymbol};
use kiln_core::InternalFault;

use super::{CodeGenerator, Result};
use crate::builder::{HandlerKind, ScopeVariable};
use crate::OpCode;

impl CodeGenerator<'_> {
    pub(crate) fn emit_stmt(&mut self, stmt: &Stmt) -> Result<()> {
        self.builder.set_span(stmt.span);
        match &stmt.kind {
            StmtKind::Block { locals, statements } => self.emit_block(locals, statements)?,

            StmtKind::List(statements) => {
                for statement in statements {
                    self.emit_stmt(statement)?;
                }
            }

            StmtKind::Expression(expr) => {
                self.emit_expr(expr, false)?;
                self.free_statement_temps();
            }

            StmtKind::Return(value) => self.emit_return(value.as_ref())?,

            StmtKind::Throw(Some(value)) => {
                self.emit_expr(value, true)?;
                self.builder.emit(OpCode::Throw);
                self.free_statement_temps();
            }
            StmtKind::Throw(None) => self.builder.emit(OpCode::Rethrow),

            StmtKind::Try {
                body,
                catches,
                finally,
            } => match finally {
                Some(finally) => {
                    self.builder.begin_try();
                    if catches.is_empty() {
                        self.emit_stmt(body)?;
                    } else {
                        self.emit_try_catch(body, catches)?;
                    }
                    self.builder.begin_handler(HandlerKind::Finally);
                    self.emit_stmt(finally)?;
                    self.builder.end_handler();
                    self.builder.end_try();
                }
                None => self.emit_try_catch(body, catches)?,
            },

            StmtKind::Label(id) => {
                let label = self.label_for(*id);
                self.builder.mark_label(label);
            }

            StmtKind::Goto(id) => {
                let label = self.label_for(*id);
                self.builder.emit_branch(OpCode::Br, label);
            }

            StmtKind::ConditionalGoto {
                condition,
                jump_if,
                label,
            } => {
                self.emit_expr(condition, true)?;
                self.free_statement_temps();
                let label = self.label_for(*label);
                let op = if *jump_if {
                    OpCode::BrTrue
                } else {
                    OpCode::BrFalse
                };
                self.builder.emit_branch(op, label);
            }

            StmtKind::Switch {
                value,
                targets,
                default,
            } => {
                self.emit_expr(value, true)?;
                self.free_statement_temps();
                let labels: Vec<_> = targets.iter().map(|id| self.label_for(*id)).collect();
                self.builder.emit_switch(&labels);
                let default = self.label_for(*default);
                self.builder.emit_branch(OpCode::Br, default);
            }

            StmtKind::Suspend { value, resume, .. } => self.emit_suspend(value.as_ref(), *resume)?,

            StmtKind::NoOp => {
                if !self.options.optimize {
                    self.builder.emit(OpCode::Nop);
                }
            }

            StmtKind::LocalDeclaration { .. } => return Err(unlowered("local declaration", stmt)),
            StmtKind::If { .. } => return Err(unlowered("if", stmt)),
            StmtKind::While { .. } => return Err(unlowered("while", stmt)),
            StmtKind::Break => return Err(unlowered("break", stmt)),
            StmtKind::Continue => return Err(unlowered("continue", stmt)),
            StmtKind::Yield(_) => return Err(unlowered("yield", stmt)),
            StmtKind::YieldBreak => return Err(unlowered("yield break", stmt)),
        }
        Ok(())
    }

    fn emit_block(&mut self, locals: &[LocalSymbol], statements: &[Stmt]) -> Result<()> {
        self.builder.open_scope();
        for local in locals {
            if !local.stack_only {
                self.locals.declare(local);
            }
        }
        for statement in statements {
            self.emit_stmt(statement)?;
        }
        let variables = self.scope_variables(locals);
        self.builder.close_scope(variables);

        for local in locals {
            if local.kind == LocalKind::Synthesized || self.options.optimize {
                self.locals.free_local(local.id);
            }
        }
        Ok(())
    }

    /// Debugger-visible variables among `locals`.
    pub(crate) fn scope_variables(&self, locals: &[LocalSymbol]) -> Vec<ScopeVariable> {
        locals
            .iter()
            .filter(|local| local.kind == LocalKind::User)
            .filter_map(|local| {
                self.locals.slot_of(local.id).map(|slot| ScopeVariable {
                    name: local.name.clone(),
                    slot,
                })
            })
            .collect()
    }

    fn emit_try_catch(&mut self, body: &Stmt, catches: &[CatchClause]) -> Result<()> {
        self.builder.begin_try();
        self.emit_stmt(body)?;
        for clause in catches {
            self.builder
                .begin_handler(HandlerKind::Catch(clause.exception_type.clone()));
            match &clause.local {
                Some(local) => {
                    let slot = self.locals.declare(local);
                    self.builder.emit_u16(OpCode::StoreLocal, slot);
                }
                None => self.builder.emit(OpCode::Pop),
            }
            self.emit_stmt(&clause.body)?;
            self.builder.end_handler();
        }
        if catches.is_empty() {
            return Err(InternalFault::UnbalancedScope);
        }
        self.builder.end_try();
        Ok(())
    }

    /// Return from the routine. Inside a protected region the value is
    /// parked in the return temp and control leaves to the shared exit.
    fn emit_return(&mut self, value: Option<&Expr>) -> Result<()> {
        if let Some(value) = value {
            self.emit_expr(value, true)?;
        }
        self.free_statement_temps();

        if !self.builder.in_protected_region() {
            self.builder.emit_ret(value.is_some());
            return Ok(());
        }

        if let Some(value) = value {
            let temp = match self.return_temp.take() {
                Some(temp) => temp,
                None => self.locals.allocate_temp(&value.ty),
            };
            self.builder.emit_u16(OpCode::StoreLocal, temp.slot);
            self.return_temp = Some(temp);
        }
        let label = match self.return_label {
            Some(label) => label,
            None => {
                let label = self.builder.define_label();
                self.return_label = Some(label);
                label
            }
        };
        self.builder.emit_branch(OpCode::Leave, label);
        Ok(())
    }

    /// A suspension point: hand `value` back to the caller and continue at
    /// `resume` on the next call.
    fn emit_suspend(&mut self, value: Option<&Expr>, resume: LabelId) -> Result<()> {
        self.suspensions.yields.push(self.builder.current_offset());
        self.emit_return(value)?;
        let label = self.label_for(resume);
        self.builder.mark_label(label);
        self.suspensions.resumes.push(self.builder.current_offset());
        Ok(())
    }
}

fn unlowered(node: &'static str, stmt: &Stmt) -> InternalFault {
    InternalFault::UnloweredNode {
        node,
        span: stmt.span,
    }
}
