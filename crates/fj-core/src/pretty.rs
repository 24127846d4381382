//! Human-readable rendering of jaxprs.
//!
//! Variables are renamed `a`, `b`, ..., `z`, `ba`, ... in order of first
//! appearance, sharing one namespace with nested graphs. Reference
//! operations print as indexed reads and writes: `b:f32[] <- a[]`,
//! `a[] <- 2`, `b:f32[], a[] <- a[], 2` and `a[] += 2`.

use crate::{Atom, Equation, Jaxpr, Primitive, Var, VarId};
use std::collections::{HashMap, HashSet};
use std::fmt::Write;

#[must_use]
pub fn pretty_print(jaxpr: &Jaxpr) -> String {
    let mut printer = Printer::default();
    let mut out = String::new();
    printer.write_jaxpr(&mut out, jaxpr, 0);
    out
}

#[derive(Default)]
struct Printer {
    names: HashMap<VarId, String>,
    next: usize,
}

fn base26(mut idx: usize) -> String {
    let mut name = Vec::new();
    loop {
        name.push(b'a' + (idx % 26) as u8);
        idx /= 26;
        if idx == 0 {
            break;
        }
    }
    name.reverse();
    String::from_utf8(name).unwrap_or_default()
}

impl Printer {
    fn name(&mut self, var: &Var) -> String {
        if let Some(name) = self.names.get(&var.id) {
            return name.clone();
        }
        let name = base26(self.next);
        self.next += 1;
        self.names.insert(var.id, name.clone());
        name
    }

    fn binder(&mut self, var: &Var) -> String {
        let name = self.name(var);
        if var.is_ref {
            format!("{name}:Ref{{{}}}", var.aval)
        } else {
            format!("{name}:{}", var.aval)
        }
    }

    fn atom(&mut self, atom: &Atom) -> String {
        match atom {
            Atom::Var(var) => self.name(var),
            Atom::Lit(lit) => lit.to_string(),
        }
    }

    fn write_jaxpr(&mut self, out: &mut String, jaxpr: &Jaxpr, indent: usize) {
        let consts: Vec<String> = jaxpr.constvars.iter().map(|v| self.binder(v)).collect();
        let invars: Vec<String> = jaxpr.invars.iter().map(|v| self.binder(v)).collect();
        let _ = writeln!(
            out,
            "{{ lambda {}; {}. let",
            consts.join(" "),
            invars.join(" ")
        );
        let used: HashSet<VarId> = jaxpr
            .equations
            .iter()
            .flat_map(|eqn| eqn.inputs.iter())
            .chain(&jaxpr.outvars)
            .filter_map(Atom::var_id)
            .collect();
        for eqn in &jaxpr.equations {
            self.write_equation(out, eqn, &used, indent + 4);
        }
        let outs: Vec<String> = jaxpr.outvars.iter().map(|a| self.atom(a)).collect();
        let tuple = match outs.len() {
            1 => format!("({},)", outs[0]),
            _ => format!("({})", outs.join(", ")),
        };
        let _ = write!(out, "{}in {tuple} }}", " ".repeat(indent + 2));
    }

    fn indices(&mut self, indices: &[Atom]) -> String {
        let rendered: Vec<String> = indices.iter().map(|a| self.atom(a)).collect();
        rendered.join(", ")
    }

    /// `None` when the equation does not have the shape of a state op.
    fn state_equation(&mut self, eqn: &Equation, used: &HashSet<VarId>) -> Option<String> {
        let (cell, rest) = eqn.inputs.split_first()?;
        let cell = self.atom(cell);
        match eqn.primitive {
            Primitive::RefGet => {
                let [slice] = eqn.outputs.as_slice() else {
                    return None;
                };
                let lhs = self.binder(slice);
                Some(format!("{lhs} <- {cell}[{}]", self.indices(rest)))
            }
            Primitive::RefSwap => {
                let (value, indices) = rest.split_first()?;
                let [old] = eqn.outputs.as_slice() else {
                    return None;
                };
                let target = format!("{cell}[{}]", self.indices(indices));
                let value = self.atom(value);
                if used.contains(&old.id) {
                    let lhs = self.binder(old);
                    Some(format!("{lhs}, {target} <- {target}, {value}"))
                } else {
                    Some(format!("{target} <- {value}"))
                }
            }
            Primitive::RefAddUpdate => {
                let (value, indices) = rest.split_first()?;
                let target = format!("{cell}[{}]", self.indices(indices));
                Some(format!("{target} += {}", self.atom(value)))
            }
            _ => None,
        }
    }

    fn write_equation(
        &mut self,
        out: &mut String,
        eqn: &Equation,
        used: &HashSet<VarId>,
        indent: usize,
    ) {
        let pad = " ".repeat(indent);
        if eqn.primitive.is_stateful()
            && let Some(line) = self.state_equation(eqn, used)
        {
            let _ = writeln!(out, "{pad}{line}");
            return;
        }
        let lhs: Vec<String> = eqn.outputs.iter().map(|v| self.binder(v)).collect();
        let lhs = if lhs.is_empty() {
            "_".to_owned()
        } else {
            lhs.join(" ")
        };
        let inputs: Vec<String> = eqn.inputs.iter().map(|a| self.atom(a)).collect();
        let inputs = inputs.join(" ");

        if eqn.sub_jaxprs.is_empty() {
            let params = if eqn.params.is_empty() {
                String::new()
            } else {
                let rendered: Vec<String> = eqn
                    .params
                    .iter()
                    .map(|(key, value)| format!("{key}=({value})"))
                    .collect();
                format!("[{}]", rendered.join(" "))
            };
            let _ = writeln!(out, "{pad}{lhs} = {}{params} {inputs}", eqn.primitive);
            return;
        }

        let _ = writeln!(out, "{pad}{lhs} = {}[", eqn.primitive);
        for (key, value) in &eqn.params {
            let _ = writeln!(out, "{pad}  {key}={value}");
        }
        match eqn.primitive {
            Primitive::Cond => {
                let _ = writeln!(out, "{pad}  branches=(");
                for branch in &eqn.sub_jaxprs {
                    let _ = write!(out, "{pad}    ");
                    self.write_jaxpr(out, branch, indent + 4);
                    out.push('\n');
                }
                let _ = writeln!(out, "{pad}  )");
            }
            primitive => {
                for (idx, sub) in eqn.sub_jaxprs.iter().enumerate() {
                    let label = match (primitive, idx) {
                        (Primitive::While, 0) => "cond_jaxpr".to_owned(),
                        (Primitive::While, 1) => "body_jaxpr".to_owned(),
                        (Primitive::Scan, 0) => "jaxpr".to_owned(),
                        _ => format!("jaxpr{idx}"),
                    };
                    let _ = write!(out, "{pad}  {label}=");
                    self.write_jaxpr(out, sub, indent + 2);
                    out.push('\n');
                }
            }
        }
        let _ = writeln!(out, "{pad}] {inputs}");
    }
}
