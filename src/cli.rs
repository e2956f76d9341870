use crate::{
    account::{AccountError, AccountService, ProfileUpdate},
    forms,
    guard::{AccessLevel, GuardDecision, RouteMatch, RouteTable, HOME_PATH, LOGIN_PATH},
    idle::{ExpiryHandler, IdleMonitor, EXPIRED_NOTICE},
    session::SessionManager,
    Args,
};
use anyhow::Result;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::sync::{Arc, Mutex};

pub struct Context {
    pub args: Args,
    pub session: Arc<SessionManager>,
    pub routes: RouteTable,
    pub account: AccountService,
    pub idle: Option<IdleMonitor>,
    /// Path the user is currently "on"
    pub location: Arc<Mutex<String>>,
}

impl Context {
    fn location(&self) -> String {
        self.location.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn navigate(&self, path: &str) {
        *self.location.lock().unwrap_or_else(|e| e.into_inner()) = path.to_string();
    }

    fn activity(&self) {
        if let Some(idle) = &self.idle {
            idle.activity();
        }
    }
}

/// Prints the expiry notice and moves the user to the login page.
pub struct TerminalNotice {
    location: Arc<Mutex<String>>,
}

impl TerminalNotice {
    pub fn new(location: Arc<Mutex<String>>) -> Self {
        Self { location }
    }
}

impl ExpiryHandler for TerminalNotice {
    fn on_expired(&self) {
        *self.location.lock().unwrap_or_else(|e| e.into_inner()) = LOGIN_PATH.to_string();
        eprintln!("\n{}", EXPIRED_NOTICE);
    }
}

/// Commands whose arguments carry secrets stay out of history.
fn carries_secret(line: &str) -> bool {
    ["/login", "/register", "/password"]
        .iter()
        .any(|cmd| line == *cmd || line.starts_with(&format!("{} ", cmd)))
}

pub fn run_once(ctx: &Context, line: &str) -> Result<()> {
    ctx.activity();
    handle_command(ctx, line.trim());
    Ok(())
}

pub fn run_repl(ctx: Context) -> Result<()> {
    let mut rl = DefaultEditor::new()?;

    println!("citypass - type /help for commands, /exit to quit");
    if let Some(identity) = ctx.session.identity() {
        println!("Welcome back, {}.", identity.display_name);
    }

    loop {
        let prompt = format!("{}> ", ctx.location());
        match rl.readline(&prompt) {
            Ok(line) => {
                ctx.activity();
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if !carries_secret(line) {
                    rl.add_history_entry(line)?;
                }
                if handle_command(&ctx, line) {
                    break;
                }
            }
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Input error: {}", e);
                break;
            }
        }
    }

    Ok(())
}

fn handle_command(ctx: &Context, line: &str) -> bool {
    let words = match shell_words::split(line) {
        Ok(words) => words,
        Err(e) => {
            println!("Could not parse command: {}", e);
            return false;
        }
    };
    let Some((cmd, rest)) = words.split_first() else {
        return false;
    };
    let rest: Vec<&str> = rest.iter().map(String::as_str).collect();

    match cmd.as_str() {
        "/exit" | "/quit" => return true,
        "/help" => print_help(),
        "/login" => match rest.as_slice() {
            [email, password] => login(ctx, email, password),
            _ => println!("Usage: /login <email> <password>"),
        },
        "/register" => match rest.as_slice() {
            [username, email, password, confirm] => {
                register(ctx, username, email, password, confirm)
            }
            _ => println!("Usage: /register <username> <email> <password> <confirm>"),
        },
        "/logout" => {
            ctx.session.logout();
            ctx.navigate(LOGIN_PATH);
            println!("Signed out.");
        }
        "/whoami" => whoami(ctx),
        "/open" => match rest.as_slice() {
            [path] => open(ctx, path),
            _ => println!("Usage: /open <path>"),
        },
        "/routes" => match rest.as_slice() {
            [] => list_routes(ctx, None),
            [level] => match AccessLevel::from_str(level) {
                Some(level) => list_routes(ctx, Some(level)),
                None => println!("Unknown access level: {}. Use: public, authenticated, privileged", level),
            },
            _ => println!("Usage: /routes [public|authenticated|privileged]"),
        },
        "/profile" => match rest.as_slice() {
            [] => show_profile(ctx),
            ["set", pairs @ ..] if !pairs.is_empty() && pairs.len() % 2 == 0 => {
                update_profile(ctx, pairs)
            }
            _ => println!("Usage: /profile | /profile set <field> <value> [<field> <value>...]"),
        },
        "/password" => match rest.as_slice() {
            [old, new] => change_password(ctx, old, new),
            _ => println!("Usage: /password <old> <new>"),
        },
        other => println!("Unknown command: {}. Type /help for commands.", other),
    }
    false
}

fn print_help() {
    println!("Commands:");
    println!("  /exit                                   - quit");
    println!("  /help                                   - show commands");
    println!("Session:");
    println!("  /login <email> <password>               - sign in");
    println!("  /register <user> <email> <pw> <confirm> - create an account and sign in");
    println!("  /logout                                 - sign out");
    println!("  /whoami                                 - show the signed-in user");
    println!("Navigation:");
    println!("  /open <path>                            - go to a page (e.g. /admin/live)");
    println!("  /routes [level]                         - list pages and who may see them");
    println!("Account:");
    println!("  /profile                                - show your profile");
    println!("  /profile set <field> <value> ...        - update username, email, first_name, last_name");
    println!("  /password <old> <new>                   - change your password");
}

fn login(ctx: &Context, email: &str, password: &str) {
    if let Err(e) = forms::validate_login(email, password) {
        println!("{}", e.message);
        return;
    }
    match ctx.session.login(email, password) {
        Ok(identity) => {
            ctx.navigate(HOME_PATH);
            println!("Welcome back, {}.", identity.display_name);
        }
        Err(e) => println!("{}", e),
    }
}

fn register(ctx: &Context, username: &str, email: &str, password: &str, confirm: &str) {
    if let Err(e) = forms::validate_registration(username, email, password, confirm) {
        println!("{}", e.message);
        return;
    }
    match ctx.session.register(username, email, password) {
        Ok(identity) => {
            ctx.navigate(HOME_PATH);
            println!("Welcome, {}. Account created.", identity.display_name);
        }
        Err(e) => println!("{}", e),
    }
}

fn whoami(ctx: &Context) {
    let session = ctx.session.snapshot();
    match session.identity() {
        Some(identity) => {
            println!("User:   {} (#{})", identity.display_name, identity.subject_id);
            println!("Email:  {}", identity.email);
            println!(
                "Access: {}",
                if identity.is_privileged { "administrator" } else { "citizen" }
            );
            if !identity.role_names.is_empty() {
                let roles: Vec<&str> = identity.role_names.iter().map(String::as_str).collect();
                println!("Roles:  {}", roles.join(", "));
            }
            if let Some(expires) = session.access_credential().and_then(|c| c.expires_at()) {
                println!("Token:  expires {}", expires.format("%Y-%m-%d %H:%M:%S UTC"));
            }
        }
        None if !session.is_resolved() => println!("Checking session..."),
        None => println!("Not signed in."),
    }
}

fn list_routes(ctx: &Context, only: Option<AccessLevel>) {
    println!("Routes:");
    for (pattern, level) in ctx.routes.routes() {
        if only.map_or(true, |only| only == *level) {
            println!("  {:<24} {}", pattern, level.as_str());
        }
    }
}

fn open(ctx: &Context, path: &str) {
    let session = ctx.session.snapshot();
    let (found, decision) = ctx.routes.decide(&session, path);
    match decision {
        GuardDecision::Render => {
            ctx.navigate(path);
            match found {
                RouteMatch::Found { pattern, .. } => println!("Showing {}", pattern),
                RouteMatch::NotFound => println!("Page not found: {}", path),
            }
        }
        GuardDecision::RedirectToLogin => {
            ctx.navigate(LOGIN_PATH);
            println!("Sign in to view {}.", path);
        }
        GuardDecision::RedirectToHome => {
            ctx.navigate(HOME_PATH);
            println!("{} requires administrator access.", path);
        }
        GuardDecision::Defer => println!("Checking session..."),
    }
}

fn report(err: AccountError) {
    match err {
        AccountError::NotSignedIn => println!("Sign in first (/login)."),
        other => println!("{}", other),
    }
}

fn show_profile(ctx: &Context) {
    match ctx.account.profile() {
        Ok(profile) => {
            println!("Username: {}", profile.username);
            println!("Email:    {}", profile.email);
            println!("Staff:    {}", if profile.is_staff { "yes" } else { "no" });
        }
        Err(e) => report(e),
    }
}

fn update_profile(ctx: &Context, pairs: &[&str]) {
    let mut update = ProfileUpdate::default();
    for pair in pairs.chunks(2) {
        if !update.set(pair[0], pair[1]) {
            println!("Unknown profile field: {}", pair[0]);
            return;
        }
    }
    match ctx.account.update_profile(&update) {
        Ok(()) => println!("Profile updated successfully!"),
        Err(e) => report(e),
    }
}

fn change_password(ctx: &Context, old: &str, new: &str) {
    if new.chars().count() < forms::MIN_PASSWORD_LEN {
        println!("Password must be at least 8 characters long.");
        return;
    }
    match ctx.account.change_password(old, new) {
        Ok(()) => println!("Password changed successfully!"),
        Err(e) => report(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_lines_skip_history() {
        assert!(carries_secret("/login a@b.com hunter22"));
        assert!(carries_secret("/register alex a@b.com pw pw"));
        assert!(carries_secret("/password old new"));
        assert!(carries_secret("/login"));
        assert!(!carries_secret("/logout"));
        assert!(!carries_secret("/loginx"));
        assert!(!carries_secret("/open /admin/live"));
    }

    #[test]
    fn test_terminal_notice_redirects_to_login() {
        let location = Arc::new(Mutex::new("/admin/live".to_string()));
        TerminalNotice::new(location.clone()).on_expired();
        assert_eq!(*location.lock().unwrap(), LOGIN_PATH);
    }
}
