//! Quantization backend seam.
//!
//! A backend only influences the model structure here, through two
//! predicates queried once at construction time: whether fused projection
//! weights are allowed, and whether it pins the rotary embedding style.
//! The answers are captured in a [`WeightLayout`] tag so the rest of the
//! code never consults the backend again.

/// Hooks a quantization scheme exposes to the model builder.
pub trait QuantBackend: Send + Sync {
    /// Whether q/k/v (and gate/up) projections may share one fused weight.
    /// Schemes with per-matrix scales must keep them separate.
    fn merge_weight(&self) -> bool;

    /// Rotary style required by the backend's fused kernels, if any.
    /// `Some(true)` forces neox rotate-half, `Some(false)` forces the
    /// interleaved layout, `None` leaves the model default in place.
    fn rope_style(&self) -> Option<bool>;
}

/// Plain unquantized weights.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoQuant;

impl QuantBackend for NoQuant {
    fn merge_weight(&self) -> bool {
        true
    }

    fn rope_style(&self) -> Option<bool> {
        None
    }
}

/// Projection weight layout, fixed once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightLayout {
    /// q/k/v live in one `qkv_proj` weight, gate/up in one `gate_up_proj`.
    Fused,
    /// Every projection keeps its own weight.
    Split,
}

impl WeightLayout {
    pub fn from_backend(backend: Option<&dyn QuantBackend>) -> Self {
        match backend {
            Some(b) if !b.merge_weight() => Self::Split,
            _ => Self::Fused,
        }
    }

    pub fn is_fused(self) -> bool {
        matches!(self, Self::Fused)
    }
}

/// Resolves the rotary style, defaulting to neox when the backend does not care.
pub fn rope_is_neox(backend: Option<&dyn QuantBackend>) -> bool {
    backend.and_then(|b| b.rope_style()).unwrap_or(true)
}
