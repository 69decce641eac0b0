use std::fmt;

use smallvec::SmallVec;
use thiserror::Error;

use crate::engine::PoolingEngine;
use crate::spec::{LayoutRole, PoolingDesc};

/// Conversion stage attached to a slot: the canonical-layout internal tensor
/// plus the primitive that fills it from the slot tensor.
pub struct Conversion<E: PoolingEngine> {
    internal: E::Tensor,
    primitive: E::Primitive,
}

impl<E: PoolingEngine> Conversion<E> {
    pub(crate) fn new(internal: E::Tensor, primitive: E::Primitive) -> Self {
        Self {
            internal,
            primitive,
        }
    }

    /// Canonical-layout tensor the compute primitive reads instead of the
    /// slot tensor.
    pub fn internal(&self) -> &E::Tensor {
        &self.internal
    }

    pub fn primitive(&self) -> &E::Primitive {
        &self.primitive
    }
}

impl<E: PoolingEngine> fmt::Debug for Conversion<E>
where
    E::Tensor: fmt::Debug,
    E::Primitive: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conversion")
            .field("internal", &self.internal)
            .field("primitive", &self.primitive)
            .finish()
    }
}

/// One caller-visible operand of a kernel.
pub struct KernelSlot<E: PoolingEngine> {
    role: LayoutRole,
    tensor: E::Tensor,
    conversion: Option<Conversion<E>>,
}

impl<E: PoolingEngine> KernelSlot<E> {
    pub(crate) fn new(
        role: LayoutRole,
        tensor: E::Tensor,
        conversion: Option<Conversion<E>>,
    ) -> Self {
        Self {
            role,
            tensor,
            conversion,
        }
    }

    pub fn role(&self) -> LayoutRole {
        self.role
    }

    pub fn tensor(&self) -> &E::Tensor {
        &self.tensor
    }

    pub fn conversion(&self) -> Option<&Conversion<E>> {
        self.conversion.as_ref()
    }
}

impl<E: PoolingEngine> fmt::Debug for KernelSlot<E>
where
    E::Tensor: fmt::Debug,
    E::Primitive: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelSlot")
            .field("role", &self.role)
            .field("tensor", &self.tensor)
            .field("conversion", &self.conversion)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("net is empty")]
    EmptyNet,
    #[error("net has {net} entries for {conversions} conversions plus compute")]
    LengthMismatch { net: usize, conversions: usize },
    #[error("conversion for input slot {slot} is out of order in the net")]
    OutOfOrder { slot: usize },
}

/// A fully built operator kernel: descriptor, instantiated template, named
/// operand slots, and the ordered execution list ("net").
///
/// The net runs input conversions in slot order, then the compute primitive;
/// executors must honor that order because the compute primitive reads the
/// converted buffers. Dropping the kernel releases every primitive, tensor,
/// and conversion scratch buffer it owns.
pub struct OpKernel<E: PoolingEngine> {
    desc: PoolingDesc,
    template: E::Template,
    inputs: SmallVec<[KernelSlot<E>; 2]>,
    outputs: SmallVec<[KernelSlot<E>; 2]>,
    net: SmallVec<[E::Primitive; 2]>,
}

impl<E: PoolingEngine> OpKernel<E> {
    pub(crate) fn new(desc: PoolingDesc, template: E::Template) -> Self {
        Self {
            desc,
            template,
            inputs: SmallVec::new(),
            outputs: SmallVec::new(),
            net: SmallVec::new(),
        }
    }

    pub(crate) fn push_input(&mut self, slot: KernelSlot<E>) {
        self.inputs.push(slot);
    }

    pub(crate) fn push_output(&mut self, slot: KernelSlot<E>) {
        self.outputs.push(slot);
    }

    pub(crate) fn push_net(&mut self, primitive: E::Primitive) {
        self.net.push(primitive);
    }

    /// Descriptor the kernel's template was instantiated from.
    pub fn descriptor(&self) -> &PoolingDesc {
        &self.desc
    }

    /// Instantiated template; a backward build pairs against the forward
    /// kernel through this value.
    pub fn template(&self) -> &E::Template {
        &self.template
    }

    pub fn inputs(&self) -> &[KernelSlot<E>] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[KernelSlot<E>] {
        &self.outputs
    }

    /// Ordered execution list: input conversions in slot order, then the
    /// compute primitive.
    pub fn net(&self) -> &[E::Primitive] {
        &self.net
    }

    pub fn has_conversions(&self) -> bool {
        self.inputs
            .iter()
            .chain(self.outputs.iter())
            .any(|slot| slot.conversion.is_some())
    }

    /// Workspace output slot (forward max-pooling kernels).
    pub fn workspace_output(&self) -> Option<&KernelSlot<E>> {
        self.outputs
            .iter()
            .find(|slot| slot.role == LayoutRole::Workspace)
    }

    /// Workspace input slot (backward max-pooling kernels).
    pub fn workspace_input(&self) -> Option<&KernelSlot<E>> {
        self.inputs
            .iter()
            .find(|slot| slot.role == LayoutRole::Workspace)
    }

    /// Structural check of the net-order invariant.
    pub fn verify(&self) -> Result<(), PlanError> {
        if self.net.is_empty() {
            return Err(PlanError::EmptyNet);
        }
        let conversions: Vec<(usize, &E::Primitive)> = self
            .inputs
            .iter()
            .chain(self.outputs.iter())
            .enumerate()
            .filter_map(|(slot, s)| s.conversion.as_ref().map(|c| (slot, c.primitive())))
            .collect();
        if self.net.len() != conversions.len() + 1 {
            return Err(PlanError::LengthMismatch {
                net: self.net.len(),
                conversions: conversions.len(),
            });
        }
        for (position, (slot, primitive)) in conversions.iter().enumerate() {
            if self.net[position] != **primitive {
                return Err(PlanError::OutOfOrder { slot: *slot });
            }
        }
        Ok(())
    }
}

impl<E: PoolingEngine> fmt::Debug for OpKernel<E>
where
    E::Tensor: fmt::Debug,
    E::Template: fmt::Debug,
    E::Primitive: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpKernel")
            .field("desc", &self.desc)
            .field("template", &self.template)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("net", &self.net)
            .finish()
    }
}
