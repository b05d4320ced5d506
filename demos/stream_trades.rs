use bitfinex_connector::{BitfinexClient, MarketEvent};
use tokio::time::{sleep, Duration};

#[tokio::main]
async fn main() {
    // Setup logging so we can see what's happening
    tracing_subscriber::fmt::init();

    let client = BitfinexClient::new();

    let _token = client.register_listener(|event| match event {
        MarketEvent::TradeBuy(trade) => {
            println!("BUY  {} {} @ {}", trade.pair, trade.amount, trade.price)
        }
        MarketEvent::TradeSell(trade) => {
            println!("SELL {} {} @ {}", trade.pair, trade.amount, trade.price)
        }
        MarketEvent::Candle(candle) => println!(
            "CANDLE {} open={} close={} vol={}",
            candle.pair, candle.open, candle.close, candle.volume
        ),
        MarketEvent::Connected => println!("connected"),
        MarketEvent::Error(msg) => eprintln!("error: {}", msg),
        MarketEvent::Disconnected => eprintln!("gave up reconnecting"),
    });

    client
        .subscribe_trades("tBTCUSD")
        .await
        .expect("subscribe failed");
    client
        .subscribe_candles("tBTCUSD", 60)
        .await
        .expect("subscribe failed");

    // Stream for a minute, then shut down cleanly.
    sleep(Duration::from_secs(60)).await;
    client.shutdown().await;
}
