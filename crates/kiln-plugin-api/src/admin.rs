//! Admin dashboard contributions: menu items and settings

use serde::{Deserialize, Serialize};

/// Menu item contributed to the admin dashboard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminMenuItem {
    /// Unique item id
    pub id: String,

    /// Display title
    pub title: String,

    /// Icon name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    /// Target URL
    pub url: String,

    /// Parent item id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,

    /// Sort order (lower first)
    #[serde(default)]
    pub order: i32,

    /// Nested items
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<AdminMenuItem>,
}

impl AdminMenuItem {
    /// Create a menu item
    pub fn new(id: impl Into<String>, title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            icon: None,
            url: url.into(),
            parent: None,
            order: 0,
            children: Vec::new(),
        }
    }

    /// Set the icon
    pub fn icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    /// Set the parent id
    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Set the sort order
    pub fn order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    /// Add a child item
    pub fn child(mut self, child: AdminMenuItem) -> Self {
        self.children.push(child);
        self
    }
}

/// Typed value of a plugin setting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SettingValue {
    /// Free-form text
    Text {
        /// Current value
        value: String,
    },

    /// Numeric value
    Number {
        /// Current value
        value: f64,
    },

    /// On/off flag
    Boolean {
        /// Current value
        value: bool,
    },

    /// One of a fixed set of options
    Select {
        /// Current value
        value: String,
        /// Allowed values
        options: Vec<String>,
    },
}

impl SettingValue {
    /// Type tag as rendered by the admin UI
    pub fn kind(&self) -> &'static str {
        match self {
            SettingValue::Text { .. } => "text",
            SettingValue::Number { .. } => "number",
            SettingValue::Boolean { .. } => "boolean",
            SettingValue::Select { .. } => "select",
        }
    }

    /// A select value must be one of its options; other kinds are always valid
    pub fn is_valid(&self) -> bool {
        match self {
            SettingValue::Select { value, options } => options.iter().any(|o| o == value),
            SettingValue::Number { value } => value.is_finite(),
            _ => true,
        }
    }
}

/// Configurable setting exposed by a plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSetting {
    /// Setting key
    pub key: String,

    /// Display label
    pub label: String,

    /// Typed value
    #[serde(flatten)]
    pub value: SettingValue,

    /// Help text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Whether a value is required
    #[serde(default)]
    pub required: bool,
}

impl PluginSetting {
    fn new(key: impl Into<String>, label: impl Into<String>, value: SettingValue) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
            value,
            description: None,
            required: false,
        }
    }

    /// Text setting
    pub fn text(key: impl Into<String>, label: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(key, label, SettingValue::Text { value: value.into() })
    }

    /// Number setting
    pub fn number(key: impl Into<String>, label: impl Into<String>, value: f64) -> Self {
        Self::new(key, label, SettingValue::Number { value })
    }

    /// Boolean setting
    pub fn boolean(key: impl Into<String>, label: impl Into<String>, value: bool) -> Self {
        Self::new(key, label, SettingValue::Boolean { value })
    }

    /// Select setting
    pub fn select<I, S>(
        key: impl Into<String>,
        label: impl Into<String>,
        value: impl Into<String>,
        options: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            key,
            label,
            SettingValue::Select {
                value: value.into(),
                options: options.into_iter().map(Into::into).collect(),
            },
        )
    }

    /// Set the help text
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Mark the setting as required
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}
