#[rocket::launch]
fn rocket() -> _ {
    let rocket = auth_server::rocket();
    log::info!("Starting auth server");
    rocket
}
