use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use smart_bookmarks::{
    config::Config,
    models::{identity::Identity, view::ViewSnapshot, OAuthProvider, ViewPhase},
    services::{BookmarkView, ViewOptions},
    state::AppState,
};

const HELP: &str = "\
commands:
  login [provider]   start sign-in (google, github, gitlab, azure, discord)
  callback <url>     finish sign-in with the redirect URL
  title <text>       set the draft title
  url <text>         set the draft URL
  add                create a bookmark from the draft
  rm <id>            delete a bookmark
  retry              re-run the failed operation
  dismiss            hide the current error
  logout             sign out
  list               show the page
  quit               exit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载配置
    dotenv::dotenv().ok();
    let config = Config::from_env()?;

    // 初始化日志（输出到 stderr，stdout 留给页面）
    init_tracing(&config);
    info!(
        "Starting smart-bookmarks in {} mode ({:?} backend)...",
        config.environment, config.backend
    );

    let state = AppState::from_config(config).await?;
    let view = BookmarkView::open(
        state.platform.clone(),
        ViewOptions::from_config(&state.config),
    )
    .await;

    // 页面渲染任务
    let mut snapshots = view.watch();
    render(&view.snapshot());
    let renderer = tokio::spawn(async move {
        let mut last = snapshots.borrow().clone();
        while snapshots.changed().await.is_ok() {
            let snapshot = snapshots.borrow().clone();
            if snapshot.phase != last.phase
                || snapshot.bookmarks != last.bookmarks
                || snapshot.error != last.error
            {
                render(&snapshot);
            }
            last = snapshot;
        }
    });

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let (command, arg) = match line.split_once(' ') {
            Some((command, arg)) => (command, arg.trim()),
            None => (line, ""),
        };

        let outcome = match command {
            "" => Ok(()),
            "login" => login(&state, &view, arg).await,
            "callback" => view.complete_sign_in(arg).await.map(|_| ()),
            "title" => {
                view.set_draft_title(arg);
                Ok(())
            }
            "url" => {
                view.set_draft_url(arg);
                Ok(())
            }
            "add" => match view.create_bookmark().await {
                Ok(Some(created)) => {
                    println!("added {}", created.id);
                    Ok(())
                }
                Ok(None) => {
                    println!("nothing to add: sign in and fill in both title and url");
                    Ok(())
                }
                Err(e) => Err(e),
            },
            "rm" => view.delete_bookmark(arg).await,
            "retry" => view.retry().await,
            "dismiss" => {
                view.dismiss_error();
                Ok(())
            }
            "logout" => view.sign_out().await,
            "list" => {
                render(&view.snapshot());
                Ok(())
            }
            "quit" | "exit" => break,
            "help" => {
                println!("{}", HELP);
                Ok(())
            }
            other => {
                println!("unknown command '{}', try help", other);
                Ok(())
            }
        };

        if let Err(e) = outcome {
            warn!("{} failed: {}", command, e);
            println!("error: {}", e);
        }
    }

    view.close().await;
    renderer.abort();
    info!("Bye");
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level)
        .unwrap_or_else(|_| EnvFilter::new("smart_bookmarks=info"));
    let registry = tracing_subscriber::registry().with(filter);

    if config.log_format == "json" {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

async fn login(state: &AppState, view: &BookmarkView, arg: &str) -> smart_bookmarks::Result<()> {
    // 内存后端直接以演示用户登录
    if let Some(demo) = &state.demo {
        let identity = Identity::new("demo-user", "demo@example.com");
        let redirect = demo.sign_in_redirect(&identity, &view.options().redirect_to);
        view.complete_sign_in(&redirect).await?;
        return Ok(());
    }

    let provider = if arg.is_empty() {
        None
    } else {
        Some(arg.parse::<OAuthProvider>()?)
    };
    let url = view.sign_in(provider).await?;
    println!("open this URL to sign in, then paste the redirect with `callback <url>`:");
    println!("  {}", url);
    Ok(())
}

fn render(snapshot: &ViewSnapshot) {
    println!();
    match snapshot.phase {
        ViewPhase::Loading => println!("loading..."),
        ViewPhase::SignedOut => println!("signed out. `login` to continue"),
        ViewPhase::SignedIn => {
            if let Some(identity) = &snapshot.identity {
                println!("signed in as {}", identity.email);
            }
            if snapshot.bookmarks.is_empty() {
                println!("  (no bookmarks)");
            }
            for bookmark in &snapshot.bookmarks {
                println!(
                    "  [{}] {}  {}  ({})",
                    bookmark.id,
                    bookmark.title,
                    bookmark.url,
                    bookmark.created_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
    }
    if let Some(error) = &snapshot.error {
        let hint = if error.recoverable {
            "`retry` or `dismiss`"
        } else {
            "`dismiss`"
        };
        println!("! {} failed: {} ({})", error.operation.label(), error.message, hint);
    }
}
