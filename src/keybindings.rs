/// Centralized keybinding definitions for xnettop
/// The help overlay, the status bar and the key handler in main all read from here

#[derive(Debug, Clone)]
pub struct KeyBinding {
    pub key: &'static str,
    pub description: &'static str,
    pub category: KeyCategory,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KeyCategory {
    Navigation,
    Sorting,
    System,
}

impl KeyCategory {
    pub fn title(&self) -> &'static str {
        match self {
            KeyCategory::Navigation => "Navigation",
            KeyCategory::Sorting => "Sorting",
            KeyCategory::System => "System",
        }
    }
}

/// Get all keybindings
pub fn get_all_keybindings() -> Vec<KeyBinding> {
    vec![
        // Navigation
        KeyBinding {
            key: "↑/k",
            description: "Move selection up",
            category: KeyCategory::Navigation,
        },
        KeyBinding {
            key: "↓/j",
            description: "Move selection down",
            category: KeyCategory::Navigation,
        },
        // Sorting
        KeyBinding {
            key: "d",
            description: "Sort by download rate (again to reverse)",
            category: KeyCategory::Sorting,
        },
        KeyBinding {
            key: "u",
            description: "Sort by upload rate (again to reverse)",
            category: KeyCategory::Sorting,
        },
        KeyBinding {
            key: "t",
            description: "Sort by total rate (again to reverse)",
            category: KeyCategory::Sorting,
        },
        KeyBinding {
            key: "n",
            description: "Sort by process name (again to reverse)",
            category: KeyCategory::Sorting,
        },
        // System
        KeyBinding {
            key: "c",
            description: "Clear accumulated statistics",
            category: KeyCategory::System,
        },
        KeyBinding {
            key: "h/?",
            description: "Toggle this help",
            category: KeyCategory::System,
        },
        KeyBinding {
            key: "q/Esc/Ctrl+C",
            description: "Quit",
            category: KeyCategory::System,
        },
    ]
}

/// Get keybindings for the status bar (most common ones)
pub fn get_status_bar_keybindings() -> Vec<(&'static str, &'static str)> {
    vec![
        ("↑↓", "Navigate"),
        ("d/u/t/n", "Sort"),
        ("c", "Clear"),
        ("h", "Help"),
        ("q", "Quit"),
    ]
}
