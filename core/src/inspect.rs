//! Inspector value model.
//!
//! Renderer components expose tweakable settings as plain values rather than
//! widgets, so the UI toolkit never leaks into renderer code. A component
//! returns its current state as a list of [`InspectorField`]s; the UI layer
//! renders them however it likes and feeds edited values back through
//! [`Inspect::apply`].

/// One editable value, described without any widget toolkit types.
#[derive(Debug, Clone, PartialEq)]
pub enum InspectorValue {
    /// A draggable scalar with soft bounds.
    DragFloat { value: f32, min: f32, max: f32, speed: f32 },
    /// A draggable integer triple with shared bounds.
    DragInt3 { value: [i32; 3], min: i32, max: i32 },
    /// A boolean toggle.
    Checkbox { value: bool },
    /// One selection out of a fixed set of options.
    Dropdown { selected: usize, options: Vec<String> },
}

/// A labeled inspector entry.
#[derive(Debug, Clone, PartialEq)]
pub struct InspectorField {
    pub label: String,
    pub value: InspectorValue,
}

impl InspectorField {
    pub fn drag_float(label: impl Into<String>, value: f32, min: f32, max: f32, speed: f32) -> Self {
        Self {
            label: label.into(),
            value: InspectorValue::DragFloat { value, min, max, speed },
        }
    }

    pub fn drag_int3(label: impl Into<String>, value: [i32; 3], min: i32, max: i32) -> Self {
        Self {
            label: label.into(),
            value: InspectorValue::DragInt3 { value, min, max },
        }
    }

    pub fn checkbox(label: impl Into<String>, value: bool) -> Self {
        Self {
            label: label.into(),
            value: InspectorValue::Checkbox { value },
        }
    }

    pub fn dropdown(label: impl Into<String>, selected: usize, options: &[&str]) -> Self {
        Self {
            label: label.into(),
            value: InspectorValue::Dropdown {
                selected,
                options: options.iter().map(|s| s.to_string()).collect(),
            },
        }
    }
}

/// Implemented by components with inspectable settings.
pub trait Inspect {
    /// Current settings as fields, in display order.
    fn fields(&self) -> Vec<InspectorField>;

    /// Apply one edited field back, matched by label.
    ///
    /// Unknown labels and mismatched value kinds are ignored.
    fn apply(&mut self, field: &InspectorField);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Settings {
        exposure: f32,
        enabled: bool,
    }

    impl Inspect for Settings {
        fn fields(&self) -> Vec<InspectorField> {
            vec![
                InspectorField::drag_float("Exposure", self.exposure, -10.0, 10.0, 0.1),
                InspectorField::checkbox("Enabled", self.enabled),
            ]
        }

        fn apply(&mut self, field: &InspectorField) {
            match (field.label.as_str(), &field.value) {
                ("Exposure", InspectorValue::DragFloat { value, .. }) => self.exposure = *value,
                ("Enabled", InspectorValue::Checkbox { value }) => self.enabled = *value,
                _ => {}
            }
        }
    }

    #[test]
    fn test_round_trip() {
        let mut settings = Settings {
            exposure: 1.0,
            enabled: false,
        };

        let mut fields = settings.fields();
        assert_eq!(fields.len(), 2);

        fields[1].value = InspectorValue::Checkbox { value: true };
        settings.apply(&fields[1]);
        assert!(settings.enabled);
    }

    #[test]
    fn test_unknown_label_ignored() {
        let mut settings = Settings {
            exposure: 1.0,
            enabled: false,
        };
        settings.apply(&InspectorField::checkbox("Missing", true));
        assert!(!settings.enabled);
    }

    #[test]
    fn test_dropdown_options() {
        let field = InspectorField::dropdown("Mode", 1, &["Off", "ACES", "Reinhard"]);
        match &field.value {
            InspectorValue::Dropdown { selected, options } => {
                assert_eq!(*selected, 1);
                assert_eq!(options.len(), 3);
            }
            other => panic!("unexpected value: {other:?}"),
        }
    }
}
