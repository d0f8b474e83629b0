use actix_files::NamedFile;
use actix_identity::Identity;
use actix_session::Session;
use actix_web::{
    get, post, route,
    web::{self, Data},
    HttpMessage, HttpRequest, HttpResponse, Responder,
};
use chrono::{Local, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use tera::Context;

use crate::{
    db,
    errors::AppError,
    flash,
    forecast::{self, ForecastOutcome, Observation, MIN_OBSERVATIONS},
    structs::{Item, ItemFields, User},
    utils::{self, see_other},
    AppState, TEMPLATES,
};

const MAX_USERNAME_LEN: usize = 80;
const MAX_EMAIL_LEN: usize = 120;
const MAX_ITEM_NAME_LEN: usize = 100;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(favicon_handler)
        .service(index_handler)
        .service(dashboard_handler)
        .service(register_handler)
        .service(register_form_handler)
        .service(login_handler)
        .service(login_form_handler)
        .service(logout_handler)
        .service(settings_handler)
        .service(settings_form_handler)
        .service(add_item_handler)
        .service(add_item_form_handler)
        .service(edit_item_handler)
        .service(edit_item_form_handler)
        .service(delete_item_handler)
        .service(record_sale_handler)
        .service(reports_handler);
}

fn render(template: &str, context: &Context) -> Result<HttpResponse, AppError> {
    let rendered = TEMPLATES.render(template, context).map_err(|e| {
        log::error!("Failed to render template: {}", e);
        AppError::TemplateError(e)
    })?;

    Ok(HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(rendered))
}

/// Context shared by every page: title, pending flashes and the signed-in user.
fn page_context(
    session: &Session,
    title: &str,
    current_user: Option<&User>,
) -> Result<Context, AppError> {
    let mut context = Context::new();
    context.insert("title", title);
    context.insert("flashes", &flash::take(session)?);
    context.insert("current_user", &current_user);
    context.insert("version", env!("CARGO_PKG_VERSION"));
    Ok(context)
}

/// Resolves the session identity to a stored user. A stale or malformed
/// identity counts as anonymous.
async fn authenticated_user(
    state: &AppState,
    identity: Option<&Identity>,
) -> Result<Option<User>, AppError> {
    let Some(identity) = identity else {
        return Ok(None);
    };
    let raw_id = identity.id()?;
    let Ok(user_id) = raw_id.parse::<i64>() else {
        log::warn!("Ignoring malformed identity {:?}", raw_id);
        return Ok(None);
    };
    Ok(db::find_user_by_id(state, user_id).await?)
}

/// Like [`authenticated_user`], but also forgets an identity that no longer
/// resolves, for the pages anonymous visitors land on.
async fn current_user_or_forget(
    state: &AppState,
    identity: Option<Identity>,
) -> Result<Option<User>, AppError> {
    let user = authenticated_user(state, identity.as_ref()).await?;
    if user.is_none() {
        if let Some(identity) = identity {
            log::warn!("Dropping identity without a matching account");
            identity.logout();
        }
    }
    Ok(user)
}

fn login_redirect(session: &Session, request: &HttpRequest) -> Result<HttpResponse, AppError> {
    flash::error(session, "Please log in to access this page.")?;
    let target = request
        .uri()
        .path_and_query()
        .map_or_else(|| request.path(), |pq| pq.as_str());
    Ok(see_other(&utils::login_path(target)))
}

/// Redirect with a status message.
fn redirect_with(
    session: &Session,
    level: flash::Level,
    message: &str,
    location: &str,
) -> Result<HttpResponse, AppError> {
    flash::push(session, level, message)?;
    Ok(see_other(location))
}

/// index handler
#[get("/")]
pub async fn index_handler(
    state: Data<AppState>,
    identity: Option<Identity>,
    session: Session,
    request: HttpRequest,
) -> Result<impl Responder, AppError> {
    let Some(user) = authenticated_user(&state, identity.as_ref()).await? else {
        return login_redirect(&session, &request);
    };

    let items = db::list_items(&state, user.id).await.map_err(|e| {
        log::error!("Failed to list items: {}", e);
        AppError::DatabaseError(e)
    })?;

    let mut context = page_context(&session, "Inventory", Some(&user))?;
    context.insert("items", &items);
    render("index.html", &context)
}

#[get("/dashboard")]
pub async fn dashboard_handler() -> impl Responder {
    see_other("/")
}

#[derive(Deserialize)]
pub struct Register {
    username: String,
    email: String,
    password: String,
    confirm_password: String,
}

/// Register handler
#[get("/register")]
pub async fn register_handler(
    state: Data<AppState>,
    identity: Option<Identity>,
    session: Session,
) -> Result<impl Responder, AppError> {
    if current_user_or_forget(&state, identity).await?.is_some() {
        return Ok(see_other("/"));
    }
    let context = page_context(&session, "Register", None)?;
    render("register.html", &context)
}

/// Register Form handler
#[post("/register")]
pub async fn register_form_handler(
    web::Form(form): web::Form<Register>,
    state: Data<AppState>,
    identity: Option<Identity>,
    session: Session,
) -> Result<impl Responder, AppError> {
    use flash::Level::Error;

    if current_user_or_forget(&state, identity).await?.is_some() {
        return Ok(see_other("/"));
    }

    let username = form.username.trim();
    let email = form.email.trim().to_lowercase();

    if username.is_empty()
        || email.is_empty()
        || form.password.is_empty()
        || form.confirm_password.is_empty()
    {
        return redirect_with(&session, Error, "All fields are required!", "/register");
    }
    if username.chars().count() > MAX_USERNAME_LEN {
        return redirect_with(
            &session,
            Error,
            "Username must be at most 80 characters!",
            "/register",
        );
    }
    if !email.contains('@') || email.chars().count() > MAX_EMAIL_LEN {
        return redirect_with(&session, Error, "Invalid email address!", "/register");
    }
    if let Some(problem) = utils::password_problem(&form.password, &form.confirm_password) {
        return redirect_with(&session, Error, problem, "/register");
    }

    if db::find_user_by_username(&state, username).await?.is_some() {
        return redirect_with(&session, Error, "Username already exists!", "/register");
    }
    if db::find_user_by_email(&state, &email).await?.is_some() {
        return redirect_with(&session, Error, "Email already registered!", "/register");
    }

    match db::create_user(&state, username, &email, &form.password).await {
        Ok(_) => {}
        // lost a race with a concurrent registration
        Err(AppError::DatabaseError(sqlx::Error::Database(e))) if e.is_unique_violation() => {
            log::warn!("Duplicate registration for username {}", username);
            return redirect_with(
                &session,
                Error,
                "Username or email already registered!",
                "/register",
            );
        }
        Err(e) => return Err(e),
    }

    flash::success(&session, "Registration successful! Please login.")?;
    Ok(see_other("/login"))
}

#[derive(Deserialize)]
pub struct Login {
    username: String,
    password: String,
}

#[derive(Deserialize)]
pub struct NextQuery {
    next: Option<String>,
}

#[get("/login")]
pub async fn login_handler(
    web::Query(query): web::Query<NextQuery>,
    state: Data<AppState>,
    identity: Option<Identity>,
    session: Session,
) -> Result<impl Responder, AppError> {
    if current_user_or_forget(&state, identity).await?.is_some() {
        return Ok(see_other("/"));
    }
    let mut context = page_context(&session, "Login", None)?;
    context.insert("next", &query.next);
    render("login.html", &context)
}

#[post("/login")]
pub async fn login_form_handler(
    web::Form(form): web::Form<Login>,
    web::Query(query): web::Query<NextQuery>,
    state: Data<AppState>,
    session: Session,
    request: HttpRequest,
) -> Result<impl Responder, AppError> {
    let username = form.username.trim();
    let user = db::find_user_by_username(&state, username).await?;

    let verified = match &user {
        Some(user) => utils::verify_password(&form.password, &user.password_hash).unwrap_or_else(
            |e| {
                log::error!("Stored hash for user id={} is unusable: {}", user.id, e);
                false
            },
        ),
        None => utils::verify_unknown_user(&form.password),
    };

    match user {
        Some(user) if verified => {
            Identity::login(&request.extensions(), user.id.to_string())?;
            log::info!("User id={} logged in", user.id);
            Ok(see_other(utils::safe_next(query.next.as_deref())))
        }
        _ => {
            log::warn!("Failed login for username {:?}", username);
            flash::error(&session, "Invalid username or password!")?;
            let back = match query.next.as_deref() {
                Some(next) => utils::login_path(utils::safe_next(Some(next))),
                None => "/login".to_owned(),
            };
            Ok(see_other(&back))
        }
    }
}

#[route("/logout", method = "GET", method = "POST")]
pub async fn logout_handler(
    identity: Option<Identity>,
    session: Session,
) -> Result<impl Responder, AppError> {
    if let Some(identity) = identity {
        identity.logout();
        flash::success(&session, "Logged out successfully!")?;
    }
    Ok(see_other("/login"))
}

#[get("/settings")]
pub async fn settings_handler(
    state: Data<AppState>,
    identity: Option<Identity>,
    session: Session,
    request: HttpRequest,
) -> Result<impl Responder, AppError> {
    let Some(user) = authenticated_user(&state, identity.as_ref()).await? else {
        return login_redirect(&session, &request);
    };
    let context = page_context(&session, "Settings", Some(&user))?;
    render("settings.html", &context)
}

#[derive(Deserialize)]
pub struct ChangePasswordForm {
    old_password: String,
    password: String,
    confirm_password: String,
}

#[post("/settings")]
pub async fn settings_form_handler(
    web::Form(form): web::Form<ChangePasswordForm>,
    state: Data<AppState>,
    identity: Option<Identity>,
    session: Session,
    request: HttpRequest,
) -> Result<impl Responder, AppError> {
    use flash::Level::{Error, Success};

    let Some(user) = authenticated_user(&state, identity.as_ref()).await? else {
        return login_redirect(&session, &request);
    };

    if form.old_password.is_empty() || form.password.is_empty() || form.confirm_password.is_empty()
    {
        return redirect_with(&session, Error, "All fields are required!", "/settings");
    }
    if !utils::verify_password(&form.old_password, &user.password_hash)? {
        log::warn!("Old password verification failed for user id={}", user.id);
        return redirect_with(&session, Error, "Current password is incorrect!", "/settings");
    }
    if let Some(problem) = utils::password_problem(&form.password, &form.confirm_password) {
        return redirect_with(&session, Error, problem, "/settings");
    }

    db::update_password(&state, user.id, &form.password).await?;
    redirect_with(&session, Success, "Password updated successfully!", "/settings")
}

#[derive(Deserialize)]
pub struct ItemForm {
    name: String,
    #[serde(default)]
    description: String,
    quantity: String,
}

impl ItemForm {
    fn validate(&self) -> Result<ItemFields, &'static str> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err("Name is required!");
        }
        if name.chars().count() > MAX_ITEM_NAME_LEN {
            return Err("Name must be at most 100 characters!");
        }
        let quantity = utils::parse_quantity(&self.quantity)
            .ok_or("Quantity must be a whole number of zero or more!")?;
        Ok(ItemFields {
            name: name.to_owned(),
            description: self.description.trim().to_owned(),
            quantity,
        })
    }
}

#[get("/add")]
pub async fn add_item_handler(
    state: Data<AppState>,
    identity: Option<Identity>,
    session: Session,
    request: HttpRequest,
) -> Result<impl Responder, AppError> {
    let Some(user) = authenticated_user(&state, identity.as_ref()).await? else {
        return login_redirect(&session, &request);
    };
    let context = page_context(&session, "Add item", Some(&user))?;
    render("add.html", &context)
}

#[post("/add")]
pub async fn add_item_form_handler(
    web::Form(form): web::Form<ItemForm>,
    state: Data<AppState>,
    identity: Option<Identity>,
    session: Session,
    request: HttpRequest,
) -> Result<impl Responder, AppError> {
    let Some(user) = authenticated_user(&state, identity.as_ref()).await? else {
        return login_redirect(&session, &request);
    };

    let fields = match form.validate() {
        Ok(fields) => fields,
        Err(problem) => return redirect_with(&session, flash::Level::Error, problem, "/add"),
    };

    db::create_item(&state, user.id, &fields).await?;
    redirect_with(
        &session,
        flash::Level::Success,
        "Item added successfully!",
        "/",
    )
}

/// Loads an item for `user`. `Err(NotFound)` for unknown ids, `Ok(None)` when
/// the item belongs to another account.
async fn owned_item(state: &AppState, user: &User, id: i64) -> Result<Option<Item>, AppError> {
    let item = db::get_item(state, id).await?.ok_or(AppError::NotFound)?;
    if item.user_id != user.id {
        log::warn!(
            "User id={} denied access to item id={} owned by user id={}",
            user.id,
            item.id,
            item.user_id
        );
        return Ok(None);
    }
    Ok(Some(item))
}

#[get("/edit/{id}")]
pub async fn edit_item_handler(
    path: web::Path<i64>,
    state: Data<AppState>,
    identity: Option<Identity>,
    session: Session,
    request: HttpRequest,
) -> Result<impl Responder, AppError> {
    let Some(user) = authenticated_user(&state, identity.as_ref()).await? else {
        return login_redirect(&session, &request);
    };
    let Some(item) = owned_item(&state, &user, path.into_inner()).await? else {
        return redirect_with(&session, flash::Level::Error, "Access denied!", "/");
    };

    let mut context = page_context(&session, "Edit item", Some(&user))?;
    context.insert("item", &item);
    render("edit.html", &context)
}

#[post("/edit/{id}")]
pub async fn edit_item_form_handler(
    path: web::Path<i64>,
    web::Form(form): web::Form<ItemForm>,
    state: Data<AppState>,
    identity: Option<Identity>,
    session: Session,
    request: HttpRequest,
) -> Result<impl Responder, AppError> {
    use flash::Level::{Error, Success};

    let Some(user) = authenticated_user(&state, identity.as_ref()).await? else {
        return login_redirect(&session, &request);
    };
    let id = path.into_inner();
    if owned_item(&state, &user, id).await?.is_none() {
        return redirect_with(&session, Error, "Access denied!", "/");
    }

    let fields = match form.validate() {
        Ok(fields) => fields,
        Err(problem) => return redirect_with(&session, Error, problem, &format!("/edit/{}", id)),
    };

    db::update_item(&state, id, user.id, &fields)
        .await?
        .ok_or(AppError::NotFound)?;
    redirect_with(&session, Success, "Item updated successfully!", "/")
}

#[post("/delete/{id}")]
pub async fn delete_item_handler(
    path: web::Path<i64>,
    state: Data<AppState>,
    identity: Option<Identity>,
    session: Session,
    request: HttpRequest,
) -> Result<impl Responder, AppError> {
    use flash::Level::{Error, Success};

    let Some(user) = authenticated_user(&state, identity.as_ref()).await? else {
        return login_redirect(&session, &request);
    };
    let id = path.into_inner();
    if owned_item(&state, &user, id).await?.is_none() {
        return redirect_with(&session, Error, "Access denied!", "/");
    }

    if !db::delete_item(&state, id, user.id).await? {
        return Err(AppError::NotFound);
    }
    redirect_with(&session, Success, "Item deleted successfully!", "/")
}

#[derive(Deserialize)]
pub struct SaleForm {
    item_id: i64,
    quantity: String,
    #[serde(default)]
    sold_on: String,
}

#[post("/record_sale")]
pub async fn record_sale_handler(
    web::Form(form): web::Form<SaleForm>,
    state: Data<AppState>,
    identity: Option<Identity>,
    session: Session,
    request: HttpRequest,
) -> Result<impl Responder, AppError> {
    use flash::Level::{Error, Success};

    let Some(user) = authenticated_user(&state, identity.as_ref()).await? else {
        return login_redirect(&session, &request);
    };

    let quantity = match utils::parse_quantity(&form.quantity) {
        Some(q) if q > 0 => q,
        _ => {
            return redirect_with(
                &session,
                Error,
                "Sale quantity must be a positive whole number!",
                "/reports",
            )
        }
    };

    let sold_on = form.sold_on.trim();
    let sold_at = if sold_on.is_empty() {
        Local::now().naive_local()
    } else {
        let Ok(date) = NaiveDate::parse_from_str(sold_on, "%Y-%m-%d") else {
            return redirect_with(
                &session,
                Error,
                "Sale date must be in YYYY-MM-DD format!",
                "/reports",
            );
        };
        if date > Local::now().date_naive() {
            return redirect_with(&session, Error, "Sale date cannot be in the future!", "/reports");
        }
        date.and_time(NaiveTime::MIN)
    };

    let Some(item) = owned_item(&state, &user, form.item_id).await? else {
        return redirect_with(&session, Error, "Access denied!", "/reports");
    };
    let not_enough = format!("Not enough stock: only {} on hand!", item.quantity);
    if item.quantity < quantity {
        return redirect_with(&session, Error, &not_enough, "/reports");
    }

    match db::record_sale(&state, user.id, item.id, quantity, sold_at).await? {
        Some(_) => redirect_with(&session, Success, "Sale recorded successfully!", "/reports"),
        // stock changed between the check and the write
        None => redirect_with(&session, Error, &not_enough, "/reports"),
    }
}

#[derive(Serialize, Debug)]
struct ItemReport {
    item: Item,
    /// `None` when the item has never been sold.
    outcome: Option<ForecastOutcome>,
}

#[derive(Serialize, Debug)]
struct ChartSeries<'a> {
    item: &'a str,
    dates: Vec<NaiveDate>,
    quantities: Vec<i64>,
}

#[get("/reports")]
pub async fn reports_handler(
    state: Data<AppState>,
    identity: Option<Identity>,
    session: Session,
    request: HttpRequest,
) -> Result<impl Responder, AppError> {
    let Some(user) = authenticated_user(&state, identity.as_ref()).await? else {
        return login_redirect(&session, &request);
    };

    let today = Local::now().date_naive();
    let items = db::list_items(&state, user.id).await?;
    let mut reports = Vec::with_capacity(items.len());
    for item in items {
        let sales = db::list_sales_for_item(&state, user.id, item.id).await?;
        let outcome = if sales.is_empty() {
            None
        } else {
            let observations: Vec<Observation> = sales
                .iter()
                .map(|sale| Observation {
                    date: sale.sold_at.date(),
                    quantity: sale.quantity,
                })
                .collect();
            Some(forecast::forecast(&observations, today))
        };
        reports.push(ItemReport { item, outcome });
    }

    let series: Vec<ChartSeries> = reports
        .iter()
        .filter_map(|report| match &report.outcome {
            Some(ForecastOutcome::Ready { forecast, .. }) => Some(ChartSeries {
                item: &report.item.name,
                dates: forecast.daily.iter().map(|d| d.date).collect(),
                quantities: forecast.daily.iter().map(|d| d.quantity).collect(),
            }),
            _ => None,
        })
        .collect();
    let chart_data = serde_json::to_string(&series).map_err(|e| {
        log::error!("Failed to encode chart data: {}", e);
        AppError::InternalServerError
    })?;

    let mut context = page_context(&session, "Reports", Some(&user))?;
    context.insert("reports", &reports);
    context.insert("chart_data", &chart_data);
    context.insert("min_observations", &MIN_OBSERVATIONS);
    context.insert("today", &today);
    render("reports.html", &context)
}

/// favicon handler
#[get("/favicon.ico")]
pub async fn favicon_handler() -> Result<impl Responder, AppError> {
    Ok(NamedFile::open("static/favicon.svg")?)
}
