/// Interactive commands for watch mode and autocomplete logic

#[derive(Debug, Clone)]
pub struct Command {
  pub name: &'static str,
  pub aliases: &'static [&'static str],
  pub usage: &'static str,
  pub description: &'static str,
}

/// All available commands
pub const COMMANDS: &[Command] = &[
  Command {
    name: "add",
    aliases: &["a", "new"],
    usage: "add <name>",
    description: "Create a task",
  },
  Command {
    name: "start",
    aliases: &["s", "begin"],
    usage: "start <id>...",
    description: "Move tasks to in-progress",
  },
  Command {
    name: "done",
    aliases: &["d", "complete", "finish"],
    usage: "done <id>...",
    description: "Mark tasks completed",
  },
  Command {
    name: "rm",
    aliases: &["remove", "delete", "del"],
    usage: "rm <id>",
    description: "Delete a task",
  },
  Command {
    name: "refresh",
    aliases: &["r", "reload"],
    usage: "refresh",
    description: "Force a reload from the server",
  },
  Command {
    name: "resume",
    aliases: &["fg", "wake"],
    usage: "resume",
    description: "Run recovery checks as if the app came back to the foreground",
  },
  Command {
    name: "offline",
    aliases: &["off"],
    usage: "offline",
    description: "Treat the connection as down until 'online'",
  },
  Command {
    name: "online",
    aliases: &["on"],
    usage: "online",
    description: "Resume connectivity probing",
  },
  Command {
    name: "status",
    aliases: &["st", "info"],
    usage: "status",
    description: "Show sync status",
  },
  Command {
    name: "help",
    aliases: &["h", "?"],
    usage: "help",
    description: "List commands",
  },
  Command {
    name: "logout",
    aliases: &[],
    usage: "logout",
    description: "Drop cached tasks and exit",
  },
  Command {
    name: "quit",
    aliases: &["q", "exit"],
    usage: "quit",
    description: "Exit taskdeck",
  },
];

/// Get autocomplete suggestions for a given input
pub fn get_suggestions(input: &str) -> Vec<&'static Command> {
  let input_lower = input.to_lowercase();

  if input_lower.is_empty() {
    return COMMANDS.iter().collect();
  }

  let mut matches: Vec<(&Command, u32)> = Vec::new();

  for cmd in COMMANDS {
    // Exact match on name
    if cmd.name == input_lower {
      matches.push((cmd, 0)); // Highest priority
      continue;
    }

    // Exact match on alias
    if cmd.aliases.contains(&input_lower.as_str()) {
      matches.push((cmd, 1));
      continue;
    }

    // Prefix match on name
    if cmd.name.starts_with(&input_lower) {
      matches.push((cmd, 2));
      continue;
    }

    // Prefix match on alias
    if cmd.aliases.iter().any(|a| a.starts_with(&input_lower)) {
      matches.push((cmd, 3));
      continue;
    }

    // Fuzzy match (contains)
    if cmd.name.contains(&input_lower) {
      matches.push((cmd, 4));
      continue;
    }

    // Fuzzy match on alias
    if cmd.aliases.iter().any(|a| a.contains(&input_lower)) {
      matches.push((cmd, 5));
    }
  }

  // Sort by priority
  matches.sort_by_key(|(_, priority)| *priority);

  matches.into_iter().map(|(cmd, _)| cmd).collect()
}

/// A parsed watch-mode command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
  Add(String),
  Start(Vec<String>),
  Done(Vec<String>),
  Remove(String),
  Refresh,
  Resume,
  Offline,
  Online,
  Status,
  Help,
  Logout,
  Quit,
}

/// Commands that only run when typed in full
const EXACT_ONLY: &[&str] = &["logout"];

/// Resolve the command word of a line: an exact name or alias, or a prefix
/// that matches a single command. Fuzzy matches are left to
/// [`get_suggestions`].
pub fn resolve(word: &str) -> Result<&'static Command, String> {
  let word = word.to_lowercase();
  if let Some(cmd) = COMMANDS
    .iter()
    .find(|cmd| cmd.name == word || cmd.aliases.contains(&word.as_str()))
  {
    return Ok(cmd);
  }

  let matches: Vec<&Command> = COMMANDS
    .iter()
    .filter(|cmd| !EXACT_ONLY.contains(&cmd.name))
    .filter(|cmd| {
      cmd.name.starts_with(&word) || cmd.aliases.iter().any(|a| a.starts_with(&word))
    })
    .collect();

  match matches.as_slice() {
    [cmd] => Ok(*cmd),
    [] => Err(format!("Unknown command '{}'. Type 'help' for a list.", word)),
    _ => Err(format!(
      "Ambiguous command '{}': {}",
      word,
      matches
        .iter()
        .map(|cmd| cmd.name)
        .collect::<Vec<_>>()
        .join(", ")
    )),
  }
}

/// Parse a command line. The first word goes through [`resolve`].
pub fn parse(line: &str) -> Result<Action, String> {
  let line = line.trim();
  let (word, rest) = match line.split_once(char::is_whitespace) {
    Some((word, rest)) => (word, rest.trim()),
    None => (line, ""),
  };
  if word.is_empty() {
    return Err("Empty command. Type 'help' for a list.".to_string());
  }

  let cmd = resolve(word)?;

  let ids = || -> Result<Vec<String>, String> {
    let ids: Vec<String> = rest.split_whitespace().map(String::from).collect();
    if ids.is_empty() {
      Err(format!("Usage: {}", cmd.usage))
    } else {
      Ok(ids)
    }
  };

  match cmd.name {
    "add" if rest.is_empty() => Err(format!("Usage: {}", cmd.usage)),
    "add" => Ok(Action::Add(rest.to_string())),
    "start" => ids().map(Action::Start),
    "done" => ids().map(Action::Done),
    "rm" => match ids()?.as_slice() {
      [id] => Ok(Action::Remove(id.clone())),
      _ => Err(format!("Usage: {}", cmd.usage)),
    },
    "refresh" => Ok(Action::Refresh),
    "resume" => Ok(Action::Resume),
    "offline" => Ok(Action::Offline),
    "online" => Ok(Action::Online),
    "status" => Ok(Action::Status),
    "help" => Ok(Action::Help),
    "logout" => Ok(Action::Logout),
    "quit" => Ok(Action::Quit),
    other => Err(format!("Unknown command '{}'. Type 'help' for a list.", other)),
  }
}

/// Help text listing every command
pub fn help() -> String {
  COMMANDS
    .iter()
    .map(|cmd| format!("  {:<16} {}", cmd.usage, cmd.description))
    .collect::<Vec<_>>()
    .join("\n")
}
