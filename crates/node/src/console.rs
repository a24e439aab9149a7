use console::style;

const WIDTH: usize = 40;

/// Operator-facing output for the CLI commands. Runtime events go through
/// `log` instead.
pub struct Console;

impl Console {
    fn border() -> String {
        "═".repeat(WIDTH)
    }

    pub fn section(title: &str) {
        println!();
        let border = Self::border();
        println!("{}", style(format!("╔{border}╗")).magenta().bold());
        println!("{}", style(format!("{title:^WIDTH$}")).magenta().bold());
        println!("{}", style(format!("╚{border}╝")).magenta().bold());
    }

    pub fn info(label: &str, value: &str) {
        println!("{}: {}", style(label).dim().magenta(), style(value).white());
    }

    pub fn success(text: &str) {
        println!("{} {}", style("✓").green().bold(), style(text).green());
    }

    pub fn warning(text: &str) {
        println!("{} {}", style("⚠").yellow().bold(), style(text).yellow());
    }

    pub fn user_error(text: &str) {
        eprintln!("{} {}", style("✗").red().bold(), style(text).red());
    }

    pub fn progress(text: &str) {
        println!("{} {}", style("→").cyan().bold(), style(text).cyan());
    }
}
