//! Type-Safe Wrappers Module
//!
//! Range checks live in the types instead of in comments.
//!
//! ## Modules
//! - `quality_factor`: constant-quality encoder parameter (0-51)
//! - `file_size`: byte counts with MB conversion and display

pub mod file_size;
pub mod quality_factor;

pub use file_size::FileSize;
pub use quality_factor::{
    QualityFactor, QualityFactorError, QUALITY_FACTOR_DEFAULT, QUALITY_FACTOR_MAX,
    QUALITY_FACTOR_MIN,
};

// ============================================================================
// Property-Based Tests
// ============================================================================
