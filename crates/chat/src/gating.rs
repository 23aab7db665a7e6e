use arbor_tree::HumanInputForm;

use super::inputs::{InputField, InputValues, files_in, is_empty_value};

/// Decides whether the compose control is disabled.
///
/// Rules short-circuit in order:
/// 1. every input is hidden: enabled;
/// 2. a required, visible field is empty: disabled;
/// 3. a file field, hidden or not, still has an upload in flight: disabled;
/// 4. the active leaf is waiting on human input forms: disabled.
pub fn is_compose_disabled(
    schema: &[InputField],
    values: &InputValues,
    pending_forms: &[HumanInputForm],
    all_inputs_hidden: bool,
) -> bool {
    if all_inputs_hidden {
        return false;
    }

    let missing_required = schema.iter().any(|field| {
        !field.hide && field.required && is_empty_value(values.get(&field.variable))
    });
    if missing_required {
        return true;
    }

    // Hidden file fields still block while uploading.
    let uploading = schema
        .iter()
        .filter(|field| field.kind.is_file())
        .filter_map(|field| values.get(&field.variable))
        .any(|value| files_in(value).iter().any(|file| file.is_uploading()));
    if uploading {
        return true;
    }

    !pending_forms.is_empty()
}
