#![forbid(unsafe_code)]

//! State discharge: rewrite reference-cell operations into pure value
//! threading.
//!
//! Each reference input becomes a plain input holding the cell's initial
//! content. Its content is threaded through the equations in program order
//! and returned as an extra output after the original ones:
//! - `get` becomes a slice read of the current content,
//! - `swap` becomes a slice write and yields the slice it replaced,
//! - `addupdate` becomes a slice read, an add and a slice write.

use fj_core::{Atom, Equation, Jaxpr, Literal, Primitive, Var, VarId};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::builder::Emitter;
use crate::error::TraceError;

pub fn discharge_state(jaxpr: &Jaxpr, is_ref: &[bool]) -> Result<Jaxpr, TraceError> {
    if is_ref.len() != jaxpr.invars.len() {
        return Err(TraceError::InvalidArgument {
            construct: "discharge",
            detail: format!(
                "graph has {} inputs, reference mask has {} entries",
                jaxpr.invars.len(),
                is_ref.len()
            ),
        });
    }
    let mut dx = Discharger {
        em: Emitter::new(),
        env: FxHashMap::default(),
        cells: FxHashMap::default(),
    };
    let mut invars = Vec::with_capacity(jaxpr.invars.len());
    let mut cell_order = Vec::new();
    for (var, &is_cell) in jaxpr.invars.iter().zip(is_ref) {
        if is_cell {
            let content = Var::new(var.aval.clone());
            dx.cells.insert(var.id, Atom::from(&content));
            cell_order.push(var.id);
            invars.push(content);
        } else {
            invars.push(var.clone());
        }
    }
    for eqn in &jaxpr.equations {
        dx.equation(eqn)?;
    }

    let mut outvars: Vec<Atom> = jaxpr.outvars.iter().map(|atom| dx.read(atom)).collect();
    for id in &cell_order {
        if let Some(content) = dx.cells.get(id) {
            outvars.push(content.clone());
        }
    }
    debug!(cells = cell_order.len(), equations = jaxpr.equations.len(), "discharged state");
    let discharged = Jaxpr::new(invars, jaxpr.constvars.clone(), outvars, dx.em.into_equations());
    discharged.validate_well_formed()?;
    Ok(discharged)
}

struct Discharger {
    em: Emitter,
    env: FxHashMap<VarId, Atom>,
    /// Current content of every reference cell.
    cells: FxHashMap<VarId, Atom>,
}

impl Discharger {
    fn read(&self, atom: &Atom) -> Atom {
        match atom {
            Atom::Var(var) => self.env.get(&var.id).cloned().unwrap_or_else(|| atom.clone()),
            Atom::Lit(_) => atom.clone(),
        }
    }

    fn cell(&self, primitive: Primitive, atom: &Atom) -> Result<(VarId, Atom), TraceError> {
        atom.var_id()
            .and_then(|id| self.cells.get(&id).map(|content| (id, content.clone())))
            .ok_or_else(|| TraceError::NotARef {
                primitive,
                detail: atom.aval().to_string(),
            })
    }

    /// Full start indices for `content` given indices into its leading axes.
    fn start_indices(&self, content: &Atom, indices: &[Atom]) -> Vec<Atom> {
        let rank = content.aval().rank();
        let mut starts: Vec<Atom> = indices.iter().map(|atom| self.read(atom)).collect();
        starts.extend(std::iter::repeat_n(Atom::Lit(Literal::I64(0)), rank - indices.len()));
        starts
    }

    fn read_slice(&mut self, content: &Atom, indices: &[Atom]) -> Result<Atom, TraceError> {
        if indices.is_empty() {
            return Ok(content.clone());
        }
        let dims = content.aval().shape.dims;
        let starts = self.start_indices(content, indices);
        let mut sizes = vec![1; indices.len()];
        sizes.extend_from_slice(&dims[indices.len()..]);
        let window = self.em.dynamic_slice(content, &starts, &sizes)?;
        self.em.reshape(&window, &dims[indices.len()..])
    }

    fn write_slice(&mut self, content: &Atom, value: &Atom, indices: &[Atom]) -> Result<Atom, TraceError> {
        let aval = content.aval();
        if indices.is_empty() {
            return self.em.convert(value, aval.dtype);
        }
        let dims = aval.shape.dims;
        let starts = self.start_indices(content, indices);
        let mut window = vec![1; indices.len()];
        window.extend_from_slice(&dims[indices.len()..]);
        let update = self.em.reshape(value, &window)?;
        self.em.dynamic_update_slice(content, &update, &starts)
    }

    fn equation(&mut self, eqn: &Equation) -> Result<(), TraceError> {
        match eqn.primitive {
            Primitive::RefGet => {
                let (_, content) = self.cell(eqn.primitive, &eqn.inputs[0])?;
                let out = self.read_slice(&content, &eqn.inputs[1..])?;
                self.env.insert(eqn.outputs[0].id, out);
            }
            Primitive::RefSwap => {
                let (id, content) = self.cell(eqn.primitive, &eqn.inputs[0])?;
                let value = self.read(&eqn.inputs[1]);
                let indices = &eqn.inputs[2..];
                let old = self.read_slice(&content, indices)?;
                let next = self.write_slice(&content, &value, indices)?;
                self.cells.insert(id, next);
                self.env.insert(eqn.outputs[0].id, old);
            }
            Primitive::RefAddUpdate => {
                let (id, content) = self.cell(eqn.primitive, &eqn.inputs[0])?;
                let value = self.read(&eqn.inputs[1]);
                let indices = &eqn.inputs[2..];
                let old = self.read_slice(&content, indices)?;
                let sum = self.em.add(&old, &value)?;
                let next = self.write_slice(&content, &sum, indices)?;
                self.cells.insert(id, next);
            }
            primitive => {
                if let Some(cell) = eqn
                    .inputs
                    .iter()
                    .find(|atom| atom.var_id().is_some_and(|id| self.cells.contains_key(&id)))
                {
                    return Err(TraceError::malformed(
                        primitive,
                        format!("reference cell {} used as a value", cell.aval()),
                    ));
                }
                let inputs: Vec<Atom> = eqn.inputs.iter().map(|atom| self.read(atom)).collect();
                self.em.push(
                    Equation::new(primitive, inputs, eqn.outputs.to_vec())
                        .with_params(eqn.params.clone())
                        .with_sub_jaxprs(eqn.sub_jaxprs.clone()),
                );
            }
        }
        Ok(())
    }
}
