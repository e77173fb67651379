#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
    pub arg: &'static str,
}

pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "effect",
        action: "select_effect",
        arg: "effect",
    },
    CommandSpec {
        command: "effects",
        action: "list_effects",
        arg: "category",
    },
    CommandSpec {
        command: "style",
        action: "apply_style",
        arg: "style",
    },
    CommandSpec {
        command: "prompt",
        action: "set_prompt",
        arg: "prompt",
    },
    CommandSpec {
        command: "history",
        action: "history",
        arg: "limit",
    },
];

pub(crate) const SINGLE_PATH_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "file",
        action: "attach_file",
        arg: "path",
    },
    CommandSpec {
        command: "save",
        action: "save_result",
        arg: "path",
    },
];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "styles",
        action: "list_styles",
        arg: "",
    },
    CommandSpec {
        command: "run",
        action: "run",
        arg: "",
    },
    CommandSpec {
        command: "status",
        action: "status",
        arg: "",
    },
    CommandSpec {
        command: "back",
        action: "back",
        arg: "",
    },
    CommandSpec {
        command: "help",
        action: "help",
        arg: "",
    },
    CommandSpec {
        command: "quit",
        action: "quit",
        arg: "",
    },
    CommandSpec {
        command: "exit",
        action: "quit",
        arg: "",
    },
];

pub const STUDIO_HELP_COMMANDS: &[&str] = &[
    "/effects [category]",
    "/effect <id>",
    "/styles",
    "/style <name>",
    "/prompt <text>",
    "/file <path>",
    "/run",
    "/status",
    "/save <path>",
    "/history [n]",
    "/back",
    "/quit",
];
