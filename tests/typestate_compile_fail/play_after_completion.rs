/// This test should FAIL to compile
/// A completed game cannot play another round

use bidbox::game::{Game, GameManifest, RoundStep};
use bidbox::GameConfig;

fn main() {
    let manifest: GameManifest = serde_json::from_str("{}").unwrap();
    let running = Game::new(GameConfig::default(), manifest)
        .unwrap()
        .initialize()
        .unwrap()
        .start();

    if let RoundStep::Finished(done) = running.play_round() {
        // This should fail: Game<Completed> has no play_round
        done.play_round();
    }
}
