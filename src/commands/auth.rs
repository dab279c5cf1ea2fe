use super::Context;
use crate::auth;
use anyhow::{Context as _, Result};
use std::io::{self, BufRead, Write};

fn prompt(label: &str) -> Result<String> {
    print!("{}: ", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(&['\r', '\n'][..]).to_string())
}

pub async fn login(ctx: &Context, email: Option<String>) -> Result<()> {
    let email = match email {
        Some(email) => email,
        None => prompt("Email")?,
    };
    let password = prompt("Password")?;
    let user = auth::login(&ctx.client, ctx.db.as_ref(), &email, &password)
        .await
        .context("login failed")?;
    println!(
        "Signed in as {}",
        user.full_name.as_deref().unwrap_or(&user.email)
    );
    Ok(())
}

pub async fn logout(ctx: &Context) -> Result<()> {
    auth::logout(&ctx.client, ctx.db.as_ref()).await?;
    println!("Signed out.");
    Ok(())
}

pub async fn whoami(ctx: &Context) -> Result<()> {
    match auth::restore(&ctx.client, ctx.db.as_ref()).await? {
        Some(user) => println!("{} ({})", user.email, user.role),
        None => println!("Not signed in; history is kept on this machine only."),
    }
    Ok(())
}
