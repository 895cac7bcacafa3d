//! Typed, insertion-ordered parameter sets.
//!
//! A run samples over a fixed set of named dimensions. Each dimension is
//! tagged at construction time as varying, fixed, or output-only, and the
//! insertion order determines the column order of every output file.

use std::sync::Arc;

/// How a dimension participates in sampling.
///
/// `Varying` dimensions are proposed, swapped and written to output.
/// `Fixed` dimensions keep their initial value for the whole run.
/// `Output` dimensions are derived quantities that are recorded but
/// never proposed or exchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaryType {
    Varying,
    Fixed,
    Output,
}

/// The named dimensions of a run, in insertion order.
///
/// Built once per run and shared between all chains through an [`Arc`];
/// every [`ParameterVector`] of the run references the same schema.
#[derive(Debug, Clone, Default)]
pub struct ParameterSchema {
    entries: Vec<(String, VaryType)>,
    varying: Vec<usize>,
}

impl ParameterSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a dimension and return its index.
    pub fn push(&mut self, name: impl Into<String>, vary: VaryType) -> usize {
        let index = self.entries.len();
        self.entries.push((name.into(), vary));
        if vary == VaryType::Varying {
            self.varying.push(index);
        }
        index
    }

    /// Builder-style [`push`](Self::push).
    pub fn with(mut self, name: impl Into<String>, vary: VaryType) -> Self {
        self.push(name, vary);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn name(&self, index: usize) -> &str {
        &self.entries[index].0
    }

    pub fn vary(&self, index: usize) -> VaryType {
        self.entries[index].1
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|(n, _)| n == name)
    }

    /// Number of varying dimensions.
    pub fn varying_count(&self) -> usize {
        self.varying.len()
    }

    /// Indices of the varying dimensions, in insertion order.
    pub fn varying_indices(&self) -> &[usize] {
        &self.varying
    }

    pub fn varying_names(&self) -> impl Iterator<Item = &str> {
        self.varying.iter().map(|&i| self.entries[i].0.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, VaryType)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), *v))
    }
}

/// A point in parameter space, dense over the schema's dimensions.
///
/// Cloning a vector copies its values; two vectors never alias.
#[derive(Debug, Clone)]
pub struct ParameterVector {
    schema: Arc<ParameterSchema>,
    values: Box<[f64]>,
}

impl ParameterVector {
    /// A zero-valued point over `schema`.
    pub fn zeros(schema: Arc<ParameterSchema>) -> Self {
        let values = vec![0f64; schema.len()].into();
        Self { schema, values }
    }

    /// A point with the given values, which must match the schema length.
    pub fn from_values(schema: Arc<ParameterSchema>, values: &[f64]) -> Self {
        assert_eq!(
            values.len(),
            schema.len(),
            "value count does not match schema"
        );
        Self {
            schema,
            values: values.into(),
        }
    }

    pub fn schema(&self) -> &Arc<ParameterSchema> {
        &self.schema
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn get(&self, index: usize) -> f64 {
        self.values[index]
    }

    pub fn set(&mut self, index: usize, value: f64) {
        self.values[index] = value;
    }

    pub fn get_by_name(&self, name: &str) -> Option<f64> {
        self.schema.index_of(name).map(|i| self.values[i])
    }

    /// The varying dimensions' values, in insertion order.
    pub fn varying(&self) -> impl Iterator<Item = f64> + '_ {
        self.schema.varying_indices().iter().map(|&i| self.values[i])
    }

    /// Copy the varying dimensions into a fresh buffer.
    pub fn copy_varying(&self) -> Box<[f64]> {
        self.varying().collect()
    }

    /// Overwrite the varying dimensions from `values`, which must hold
    /// exactly one entry per varying dimension.
    pub fn set_varying(&mut self, values: &[f64]) {
        let indices = self.schema.varying_indices();
        assert_eq!(
            values.len(),
            indices.len(),
            "varying value count does not match schema"
        );
        for (&i, &v) in indices.iter().zip(values) {
            self.values[i] = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn schema() -> Arc<ParameterSchema> {
        Arc::new(
            ParameterSchema::new()
                .with("chirpmass", VaryType::Varying)
                .with("f_ref", VaryType::Fixed)
                .with("distance", VaryType::Varying)
                .with("snr", VaryType::Output),
        )
    }

    #[test]
    fn insertion_order_is_preserved() {
        let schema = schema();
        let names: Vec<_> = schema.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["chirpmass", "f_ref", "distance", "snr"]);
        let varying: Vec<_> = schema.varying_names().collect();
        assert_eq!(varying, vec!["chirpmass", "distance"]);
        assert_eq!(schema.varying_count(), 2);
    }

    #[test]
    fn varying_round_trip() {
        let mut point = ParameterVector::from_values(schema(), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(point.copy_varying().as_ref(), &[1.0, 3.0]);

        point.set_varying(&[10.0, 30.0]);
        assert_eq!(point.values(), &[10.0, 2.0, 30.0, 4.0]);
        assert_eq!(point.get_by_name("f_ref"), Some(2.0));
        assert_eq!(point.get_by_name("missing"), None);
    }

    #[test]
    #[should_panic(expected = "varying value count")]
    fn set_varying_checks_length() {
        let mut point = ParameterVector::zeros(schema());
        point.set_varying(&[1.0]);
    }
}
