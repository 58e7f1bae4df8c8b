use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Widgets understood by the host's settings renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Component {
    #[serde(rename = "VForm")]
    Form,
    #[serde(rename = "VRow")]
    Row,
    #[serde(rename = "VCol")]
    Col,
    #[serde(rename = "VSwitch")]
    Switch,
    #[serde(rename = "VTextarea")]
    Textarea,
    #[serde(rename = "VTextField")]
    TextField,
    #[serde(rename = "VAlert")]
    Alert,
}

/// One node of the declarative settings form. The host renders the tree and
/// writes every `model` prop back into the flat settings object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormNode {
    pub component: Component,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub props: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<FormNode>,
}

impl FormNode {
    fn new(component: Component) -> Self {
        Self {
            component,
            props: Map::new(),
            content: Vec::new(),
        }
    }

    pub fn form(content: Vec<FormNode>) -> Self {
        Self::new(Component::Form).with_content(content)
    }

    pub fn row(content: Vec<FormNode>) -> Self {
        Self::new(Component::Row).with_content(content)
    }

    pub fn col(cols: u8, content: Vec<FormNode>) -> Self {
        Self::new(Component::Col)
            .prop("cols", cols)
            .with_content(content)
    }

    pub fn switch(model: impl Into<String>, label: impl Into<String>) -> Self {
        Self::new(Component::Switch)
            .prop("model", model.into())
            .prop("label", label.into())
    }

    pub fn textarea(model: impl Into<String>, label: impl Into<String>, rows: u8) -> Self {
        Self::new(Component::Textarea)
            .prop("model", model.into())
            .prop("label", label.into())
            .prop("rows", rows)
    }

    pub fn number_field(model: impl Into<String>, label: impl Into<String>) -> Self {
        Self::new(Component::TextField)
            .prop("model", model.into())
            .prop("label", label.into())
            .prop("type", "number")
    }

    pub fn alert(kind: &str, text: impl Into<String>) -> Self {
        Self::new(Component::Alert)
            .prop("type", kind)
            .prop("variant", "tonal")
            .prop("text", text.into())
    }

    /// Sets a renderer prop, replacing any previous value.
    pub fn prop(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.props.insert(key.to_string(), value.into());
        self
    }

    pub fn with_content(mut self, content: Vec<FormNode>) -> Self {
        self.content = content;
        self
    }

    pub fn model(&self) -> Option<&str> {
        self.props.get("model").and_then(Value::as_str)
    }

    /// Collects every settings key bound anywhere below this node, depth first.
    pub fn models(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_models(&mut out);
        out
    }

    fn collect_models<'a>(&'a self, out: &mut Vec<&'a str>) {
        if let Some(model) = self.model() {
            out.push(model);
        }
        for child in &self.content {
            child.collect_models(out);
        }
    }
}
